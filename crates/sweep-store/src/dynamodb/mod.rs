//! Amazon DynamoDB backend.
//!
//! Queries and scans are single-page calls; the [`Paginator`](crate::Paginator)
//! drives the continuation. Batch writes resend unprocessed items with backoff
//! before reporting the batch as throttled.

mod expr;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::{AttributeValue, DeleteRequest, PutRequest, WriteRequest};
use aws_smithy_types::timeout::TimeoutConfig;
use backoff::backoff::Backoff;
use tracing::{debug, warn};

use crate::StoreError;
use crate::condition::ReadRequest;
use crate::record::{Cursor, PARTITION_KEY, Record, RecordKey, SORT_KEY};
use crate::retry::RetryConfig;
use crate::store::{MAX_BATCH_WRITE, Page, Store, WriteOp};

use expr::{ExpressionBuilder, from_item, to_item};

/// Client overrides applied on top of the shared AWS configuration.
#[derive(Debug, Clone, Default)]
pub struct DynamoConfig {
    /// AWS region (SDK default when unset).
    pub region: Option<String>,
    /// Endpoint override, e.g. DynamoDB Local.
    pub endpoint: Option<String>,
    /// Per-operation timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

/// [`Store`] backed by DynamoDB tables addressed by name.
#[derive(Clone)]
pub struct DynamoStore {
    client: Client,
    unprocessed_retry: RetryConfig,
}

impl std::fmt::Debug for DynamoStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamoStore").finish_non_exhaustive()
    }
}

impl DynamoStore {
    pub fn new(sdk_config: &aws_config::SdkConfig, config: DynamoConfig) -> Self {
        let mut builder = aws_sdk_dynamodb::config::Builder::from(sdk_config);

        if let Some(region) = config.region {
            builder = builder.region(aws_sdk_dynamodb::config::Region::new(region));
        }
        if let Some(endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        if let Some(timeout_ms) = config.timeout_ms {
            let timeout_config = TimeoutConfig::builder()
                .operation_timeout(Duration::from_millis(timeout_ms))
                .build();
            builder = builder.timeout_config(timeout_config);
        }

        Self::from_client(Client::from_conf(builder.build()))
    }

    /// Wrap a pre-built client.
    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            unprocessed_retry: RetryConfig::default(),
        }
    }

    pub fn with_unprocessed_retry(mut self, retry: RetryConfig) -> Self {
        self.unprocessed_retry = retry;
        self
    }

    fn start_key(cursor: Option<&Cursor>) -> Option<HashMap<String, AttributeValue>> {
        cursor.map(|c| to_item(c.attributes()))
    }

    fn page_from(
        items: &[HashMap<String, AttributeValue>],
        last_key: Option<&HashMap<String, AttributeValue>>,
    ) -> Result<Page, StoreError> {
        let items = items
            .iter()
            .map(|item| from_item(item).map(Record::from))
            .collect::<Result<Vec<_>, _>>()?;
        let cursor = match last_key {
            Some(key) if !key.is_empty() => Some(Cursor::from_attributes(from_item(key)?)),
            _ => None,
        };
        Ok(Page { items, cursor })
    }

    fn write_request(op: &WriteOp) -> Result<WriteRequest, StoreError> {
        let request = match op {
            WriteOp::Put(record) => {
                record.require_key()?;
                let put = PutRequest::builder()
                    .set_item(Some(to_item(record.attributes())))
                    .build()
                    .map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
                WriteRequest::builder().put_request(put).build()
            }
            WriteOp::Delete(key) => {
                let delete = DeleteRequest::builder()
                    .key(PARTITION_KEY, AttributeValue::S(key.pk.clone()))
                    .key(SORT_KEY, AttributeValue::S(key.sk.clone()))
                    .build()
                    .map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
                WriteRequest::builder().delete_request(delete).build()
            }
        };
        Ok(request)
    }
}

/// Classify an SDK failure by transport outcome and service error code.
fn map_sdk_error<E, R>(operation: &str, err: SdkError<E, R>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let message = format!("DynamoDB {} failed: {}", operation, DisplayErrorContext(&err));
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StoreError::Unavailable(message)
        }
        SdkError::ServiceError(service_err) => match service_err.err().code() {
            Some(
                "ProvisionedThroughputExceededException"
                | "ThrottlingException"
                | "RequestLimitExceeded",
            ) => StoreError::Throttled(message),
            Some("InternalServerError" | "ServiceUnavailable") => StoreError::Unavailable(message),
            Some("ValidationException" | "ResourceNotFoundException") => {
                StoreError::InvalidRequest(message)
            }
            _ => StoreError::Backend(message),
        },
        _ => StoreError::Backend(message),
    }
}

#[async_trait]
impl Store for DynamoStore {
    async fn read_page(
        &self,
        request: &ReadRequest,
        start: Option<&Cursor>,
    ) -> Result<Page, StoreError> {
        let mut builder = ExpressionBuilder::default();
        let filter = request
            .filter
            .as_ref()
            .map(|f| builder.filter(f))
            .transpose()?;
        let limit = request.limit.map(|l| l.min(i32::MAX as u32) as i32);

        match &request.key {
            Some(key) => {
                let key_expr = builder.key_condition(key);
                let (names, values) = builder.into_parts();
                let response = self
                    .client
                    .query()
                    .table_name(&request.table)
                    .set_index_name(request.index.clone())
                    .key_condition_expression(key_expr)
                    .set_filter_expression(filter)
                    .set_expression_attribute_names(names)
                    .set_expression_attribute_values(values)
                    .set_limit(limit)
                    .set_exclusive_start_key(Self::start_key(start))
                    .send()
                    .await
                    .map_err(|e| map_sdk_error("Query", e))?;
                Self::page_from(response.items(), response.last_evaluated_key())
            }
            None => {
                let (names, values) = builder.into_parts();
                let response = self
                    .client
                    .scan()
                    .table_name(&request.table)
                    .set_index_name(request.index.clone())
                    .set_filter_expression(filter)
                    .set_expression_attribute_names(names)
                    .set_expression_attribute_values(values)
                    .set_limit(limit)
                    .set_exclusive_start_key(Self::start_key(start))
                    .send()
                    .await
                    .map_err(|e| map_sdk_error("Scan", e))?;
                Self::page_from(response.items(), response.last_evaluated_key())
            }
        }
    }

    async fn batch_write(&self, table: &str, ops: &[WriteOp]) -> Result<(), StoreError> {
        if ops.len() > MAX_BATCH_WRITE {
            return Err(StoreError::BatchTooLarge {
                size: ops.len(),
                max: MAX_BATCH_WRITE,
            });
        }
        if ops.is_empty() {
            return Ok(());
        }

        let mut pending = ops
            .iter()
            .map(Self::write_request)
            .collect::<Result<Vec<_>, _>>()?;
        let mut backoff = self.unprocessed_retry.backoff();
        let mut attempt = 0;

        loop {
            let response = self
                .client
                .batch_write_item()
                .request_items(table, pending)
                .send()
                .await
                .map_err(|e| map_sdk_error("BatchWriteItem", e))?;

            let unprocessed = response
                .unprocessed_items()
                .and_then(|items| items.get(table))
                .cloned()
                .unwrap_or_default();
            if unprocessed.is_empty() {
                debug!(table, size = ops.len(), "batch written");
                return Ok(());
            }

            if attempt >= self.unprocessed_retry.max_retries {
                return Err(StoreError::Throttled(format!(
                    "{} of {} items left unprocessed in {}",
                    unprocessed.len(),
                    ops.len(),
                    table
                )));
            }
            attempt += 1;
            let wait = backoff
                .next_backoff()
                .unwrap_or(self.unprocessed_retry.max_interval);
            warn!(
                table,
                attempt,
                unprocessed = unprocessed.len(),
                backoff_ms = wait.as_millis() as u64,
                "unprocessed items in batch write, resending"
            );
            tokio::time::sleep(wait).await;
            pending = unprocessed;
        }
    }

    async fn get(&self, table: &str, key: &RecordKey) -> Result<Option<Record>, StoreError> {
        let response = self
            .client
            .get_item()
            .table_name(table)
            .key(PARTITION_KEY, AttributeValue::S(key.pk.clone()))
            .key(SORT_KEY, AttributeValue::S(key.sk.clone()))
            .send()
            .await
            .map_err(|e| map_sdk_error("GetItem", e))?;

        response
            .item()
            .map(|item| from_item(item).map(Record::from))
            .transpose()
    }
}
