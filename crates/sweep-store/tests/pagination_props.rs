//! Property-based tests for pagination and batch writing.

use std::collections::BTreeSet;

use proptest::prelude::*;
use sweep_store::{
    BatchWriter, Filter, KeyCondition, MemoryStore, Paginator, ReadRequest, Record, RecordKey,
    RetryConfig, WriteMode,
};

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

// Strategy for generating asset rows spread over a few tenants
fn asset_rows() -> impl Strategy<Value = Vec<(u8, u16, bool)>> {
    prop::collection::vec((0u8..4, 0u16..500, proptest::bool::ANY), 0..80)
}

fn to_record((tenant, asset, active): (u8, u16, bool)) -> Record {
    RecordKey::new(format!("TENANT#{}", tenant), format!("ASSET#{:04}", asset))
        .to_record()
        .with("tenant_id", tenant.to_string())
        .with("is_active", active)
}

fn keys(records: &[Record]) -> Vec<RecordKey> {
    records.iter().filter_map(Record::key).collect()
}

async fn seeded(rows: &[(u8, u16, bool)]) -> MemoryStore {
    let store = MemoryStore::new();
    store
        .insert_all("Assets", rows.iter().copied().map(to_record))
        .await
        .unwrap();
    store
}

proptest! {
    // Paging with any page size yields exactly the unpaginated result
    #[test]
    fn pagination_is_complete_for_any_page_size(
        rows in asset_rows(),
        page_size in 1u32..30,
        tenant in 0u8..4,
        only_active in proptest::bool::ANY,
    ) {
        let (paged, whole) = block_on(async {
            let store = seeded(&rows).await;
            let mut request = ReadRequest::query(
                "Assets",
                KeyCondition::partition(format!("TENANT#{}", tenant)),
            );
            if only_active {
                request = request.with_filter(Filter::eq("is_active", true));
            }
            let paged = Paginator::new(&store, request.clone().with_limit(page_size))
                .collect_all()
                .await
                .unwrap();
            let whole = Paginator::new(&store, request).collect_all().await.unwrap();
            (paged, whole)
        });

        let paged_keys = keys(&paged);
        let unique: BTreeSet<_> = paged_keys.iter().cloned().collect();
        prop_assert_eq!(unique.len(), paged_keys.len());
        prop_assert_eq!(paged_keys, keys(&whole));
    }

    // Resuming from any intermediate cursor finishes the same read
    #[test]
    fn resume_from_any_page_matches_uninterrupted(
        rows in asset_rows(),
        page_size in 1u32..10,
        stop_after in 0usize..6,
    ) {
        let (resumed, whole) = block_on(async {
            let store = seeded(&rows).await;
            let request = ReadRequest::scan("Assets").with_limit(page_size);

            let mut first = Paginator::new(&store, request.clone());
            let mut seen = Vec::new();
            for _ in 0..stop_after {
                match first.next_page().await.unwrap() {
                    Some(page) => seen.extend(page.items),
                    None => break,
                }
            }
            if !first.is_exhausted() {
                let rest = Paginator::new(&store, request.clone())
                    .resume_from(first.cursor().cloned())
                    .collect_all()
                    .await
                    .unwrap();
                seen.extend(rest);
            }
            let whole = Paginator::new(&store, request).collect_all().await.unwrap();
            (seen, whole)
        });
        prop_assert_eq!(keys(&resumed), keys(&whole));
    }

    // Writes take ceil(n / chunk) calls; dry runs take none
    #[test]
    fn batch_writer_call_count(rows in asset_rows(), chunk in 1usize..=25, dry_run in proptest::bool::ANY) {
        let (summary, calls, stored, expected) = block_on(async {
            let store = MemoryStore::new();
            let records: Vec<Record> = rows.iter().copied().map(to_record).collect();
            let expected: BTreeSet<_> = keys(&records).into_iter().collect();
            let summary = BatchWriter::new(&store, "Assets")
                .chunk_size(chunk)
                .dry_run(dry_run)
                .retry(RetryConfig::none())
                .write(records, WriteMode::Upsert)
                .await
                .unwrap();
            (summary, store.write_calls(), store.len("Assets").await, expected.len())
        });

        prop_assert_eq!(summary.applied, expected);
        prop_assert_eq!(summary.chunks, expected.div_ceil(chunk));
        if dry_run {
            prop_assert_eq!(calls, 0);
            prop_assert_eq!(stored, 0);
        } else {
            prop_assert_eq!(calls, expected.div_ceil(chunk));
            prop_assert_eq!(stored, expected);
        }
    }
}
