//! DynamoDB persistence backend.
//!
//! One item per record. The in-progress save is a single conditional
//! `PutItem`; the condition admits the write when the key is absent, the
//! record has expired, or an in-progress record's in-progress expiry has
//! passed.
//!
//! In composite-key mode every record of a function shares one static
//! partition value and the idempotency key moves to the sort key.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::SdkError;
use aws_sdk_dynamodb::operation::put_item::PutItemError;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;

use crate::clock::{SharedClock, SystemClock};
use crate::config::lambda_function_name;
use crate::error::{IdempotencyError, IdempotencyResult};
use crate::persistence::{PersistenceBackend, WriteOutcome};
use crate::record::{DataRecord, RecordStatus};
use crate::types::IdempotencyKey;

/// Condition admitting an in-progress save.
pub const PUT_CONDITION: &str = "attribute_not_exists(#id) OR #expiry < :now OR \
     (#status = :inprogress AND attribute_exists(#in_progress_expiry) AND #in_progress_expiry < :now_in_millis)";

/// DynamoDB table layout and connection overrides.
#[derive(Debug, Clone)]
pub struct DynamoDbConfig {
    /// Table name
    pub table_name: String,
    /// Partition key attribute
    pub key_attr: String,
    /// Partition value used in composite-key mode
    pub static_pk_value: Option<String>,
    /// Sort key attribute; setting it enables composite-key mode
    pub sort_key_attr: Option<String>,
    /// Expiry attribute, epoch seconds
    pub expiry_attr: String,
    /// In-progress expiry attribute, epoch milliseconds
    pub in_progress_expiry_attr: String,
    /// Status attribute
    pub status_attr: String,
    /// Serialized result attribute
    pub data_attr: String,
    /// Payload hash attribute
    pub validation_key_attr: String,
    /// Region override
    pub region: Option<String>,
    /// Endpoint override, e.g. DynamoDB Local
    pub endpoint: Option<String>,
}

impl DynamoDbConfig {
    /// Creates a config with the default attribute names.
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            key_attr: "id".to_string(),
            static_pk_value: None,
            sort_key_attr: None,
            expiry_attr: "expiration".to_string(),
            in_progress_expiry_attr: "in_progress_expiration".to_string(),
            status_attr: "status".to_string(),
            data_attr: "data".to_string(),
            validation_key_attr: "validation".to_string(),
            region: None,
            endpoint: None,
        }
    }

    /// Sets the partition key attribute.
    pub fn with_key_attr(mut self, attr: impl Into<String>) -> Self {
        self.key_attr = attr.into();
        self
    }

    /// Enables composite-key mode with the given sort key attribute.
    pub fn with_sort_key_attr(mut self, attr: impl Into<String>) -> Self {
        self.sort_key_attr = Some(attr.into());
        self
    }

    /// Sets the static partition value used in composite-key mode.
    pub fn with_static_pk_value(mut self, value: impl Into<String>) -> Self {
        self.static_pk_value = Some(value.into());
        self
    }

    /// Sets the expiry attribute.
    pub fn with_expiry_attr(mut self, attr: impl Into<String>) -> Self {
        self.expiry_attr = attr.into();
        self
    }

    /// Sets the in-progress expiry attribute.
    pub fn with_in_progress_expiry_attr(mut self, attr: impl Into<String>) -> Self {
        self.in_progress_expiry_attr = attr.into();
        self
    }

    /// Sets the status attribute.
    pub fn with_status_attr(mut self, attr: impl Into<String>) -> Self {
        self.status_attr = attr.into();
        self
    }

    /// Sets the result attribute.
    pub fn with_data_attr(mut self, attr: impl Into<String>) -> Self {
        self.data_attr = attr.into();
        self
    }

    /// Sets the payload hash attribute.
    pub fn with_validation_key_attr(mut self, attr: impl Into<String>) -> Self {
        self.validation_key_attr = attr.into();
        self
    }

    /// Overrides the region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Overrides the endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    fn validate(&self) -> IdempotencyResult<()> {
        if self.table_name.is_empty() {
            return Err(IdempotencyError::configuration("table_name cannot be empty"));
        }
        if self.sort_key_attr.as_deref() == Some(self.key_attr.as_str()) {
            return Err(IdempotencyError::configuration(format!(
                "key_attr and sort_key_attr cannot both be '{}'",
                self.key_attr
            )));
        }
        Ok(())
    }
}

/// Layout logic shared by every request: keys, items and record decoding.
#[derive(Debug, Clone)]
struct TableLayout {
    config: DynamoDbConfig,
    static_pk_value: String,
}

impl TableLayout {
    fn new(config: DynamoDbConfig) -> IdempotencyResult<Self> {
        config.validate()?;
        let static_pk_value = config.static_pk_value.clone().unwrap_or_else(|| {
            format!("idempotency#{}", lambda_function_name().unwrap_or_default())
        });
        Ok(Self {
            config,
            static_pk_value,
        })
    }

    fn key(&self, key: &IdempotencyKey) -> HashMap<String, AttributeValue> {
        let mut attrs = HashMap::new();
        match &self.config.sort_key_attr {
            Some(sort_key_attr) => {
                attrs.insert(
                    self.config.key_attr.clone(),
                    AttributeValue::S(self.static_pk_value.clone()),
                );
                attrs.insert(sort_key_attr.clone(), AttributeValue::S(key.to_string()));
            }
            None => {
                attrs.insert(self.config.key_attr.clone(), AttributeValue::S(key.to_string()));
            }
        }
        attrs
    }

    fn in_progress_item(&self, record: &DataRecord) -> HashMap<String, AttributeValue> {
        let c = &self.config;
        let mut item = self.key(&record.idempotency_key);
        item.insert(
            c.status_attr.clone(),
            AttributeValue::S(RecordStatus::InProgress.as_str().to_string()),
        );
        if let Some(expiry) = record.expiry_timestamp {
            item.insert(c.expiry_attr.clone(), AttributeValue::N(expiry.to_string()));
        }
        if let Some(in_progress_expiry) = record.in_progress_expiry_timestamp {
            item.insert(
                c.in_progress_expiry_attr.clone(),
                AttributeValue::N(in_progress_expiry.to_string()),
            );
        }
        if let Some(hash) = &record.payload_hash {
            item.insert(c.validation_key_attr.clone(), AttributeValue::S(hash.clone()));
        }
        item
    }

    fn condition_names(&self) -> HashMap<String, String> {
        let c = &self.config;
        HashMap::from([
            ("#id".to_string(), c.key_attr.clone()),
            ("#expiry".to_string(), c.expiry_attr.clone()),
            ("#in_progress_expiry".to_string(), c.in_progress_expiry_attr.clone()),
            ("#status".to_string(), c.status_attr.clone()),
        ])
    }

    fn condition_values(&self, now_millis: i64) -> HashMap<String, AttributeValue> {
        HashMap::from([
            (
                ":now".to_string(),
                AttributeValue::N(now_millis.div_euclid(1000).to_string()),
            ),
            (":now_in_millis".to_string(), AttributeValue::N(now_millis.to_string())),
            (
                ":inprogress".to_string(),
                AttributeValue::S(RecordStatus::InProgress.as_str().to_string()),
            ),
        ])
    }

    /// `SET` expression, names and values for completing a record.
    fn success_update(
        &self,
        record: &DataRecord,
    ) -> (String, HashMap<String, String>, HashMap<String, AttributeValue>) {
        let c = &self.config;
        let mut expression = "SET #response_data = :response_data, #status = :status".to_string();
        let mut names = HashMap::from([
            ("#response_data".to_string(), c.data_attr.clone()),
            ("#status".to_string(), c.status_attr.clone()),
        ]);
        let mut values = HashMap::from([
            (
                ":response_data".to_string(),
                AttributeValue::S(record.response_data.clone().unwrap_or_default()),
            ),
            (
                ":status".to_string(),
                AttributeValue::S(RecordStatus::Completed.as_str().to_string()),
            ),
        ]);
        if let Some(expiry) = record.expiry_timestamp {
            expression.push_str(", #expiry = :expiry");
            names.insert("#expiry".to_string(), c.expiry_attr.clone());
            values.insert(":expiry".to_string(), AttributeValue::N(expiry.to_string()));
        }
        if let Some(hash) = &record.payload_hash {
            expression.push_str(", #validation_key = :validation_key");
            names.insert("#validation_key".to_string(), c.validation_key_attr.clone());
            values.insert(":validation_key".to_string(), AttributeValue::S(hash.clone()));
        }
        (expression, names, values)
    }

    fn item_to_record(
        &self,
        item: &HashMap<String, AttributeValue>,
    ) -> IdempotencyResult<DataRecord> {
        let c = &self.config;
        let key_attr = c.sort_key_attr.as_ref().unwrap_or(&c.key_attr);
        let key = item
            .get(key_attr)
            .and_then(|v| v.as_s().ok())
            .ok_or_else(|| {
                IdempotencyError::persistence(
                    "DynamoDB item is malformed",
                    format!("missing string attribute '{key_attr}'"),
                )
            })?;
        let status = item
            .get(&c.status_attr)
            .and_then(|v| v.as_s().ok())
            .ok_or_else(|| IdempotencyError::InvalidStatus {
                status: String::new(),
            })?
            .parse::<RecordStatus>()?;
        let number = |attr: &str| {
            item.get(attr)
                .and_then(|v| v.as_n().ok())
                .and_then(|n| n.parse::<i64>().ok())
        };
        let string = |attr: &str| item.get(attr).and_then(|v| v.as_s().ok()).cloned();

        let mut record = DataRecord::new(IdempotencyKey::from(key.as_str()), status)
            .with_in_progress_expiry(number(&c.in_progress_expiry_attr))
            .with_payload_hash(string(&c.validation_key_attr));
        record.expiry_timestamp = number(&c.expiry_attr);
        record.response_data = string(&c.data_attr);
        Ok(record)
    }
}

fn is_put_conditional_check_failed<R>(err: &SdkError<PutItemError, R>) -> bool {
    match err {
        SdkError::ServiceError(service_err) => {
            matches!(
                service_err.err(),
                PutItemError::ConditionalCheckFailedException(_)
            )
        }
        _ => false,
    }
}

/// Backend storing records in a DynamoDB table.
#[derive(Clone)]
pub struct DynamoDbBackend {
    client: Client,
    layout: TableLayout,
    clock: SharedClock,
}

impl std::fmt::Debug for DynamoDbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamoDbBackend")
            .field("table_name", &self.layout.config.table_name)
            .field("sort_key_attr", &self.layout.config.sort_key_attr)
            .finish()
    }
}

impl DynamoDbBackend {
    /// Creates a backend from a loaded AWS SDK config.
    ///
    /// Region and endpoint overrides in `config` take precedence over `sdk_config`.
    pub fn new(sdk_config: &aws_config::SdkConfig, config: DynamoDbConfig) -> IdempotencyResult<Self> {
        let mut builder = aws_sdk_dynamodb::config::Builder::from(sdk_config);
        if let Some(region) = &config.region {
            builder = builder.region(aws_sdk_dynamodb::config::Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        let client = Client::from_conf(builder.build());
        Self::from_client(client, config)
    }

    /// Creates a backend from the environment's AWS configuration.
    pub async fn from_env(config: DynamoDbConfig) -> IdempotencyResult<Self> {
        let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(&sdk_config, config)
    }

    /// Creates a backend from a pre-built client.
    pub fn from_client(client: Client, config: DynamoDbConfig) -> IdempotencyResult<Self> {
        Ok(Self {
            client,
            layout: TableLayout::new(config)?,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replaces the clock used for the conditional write.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// The partition value used in composite-key mode.
    pub fn static_pk_value(&self) -> &str {
        &self.layout.static_pk_value
    }
}

#[async_trait]
impl PersistenceBackend for DynamoDbBackend {
    async fn save_in_progress(&self, record: &DataRecord) -> IdempotencyResult<WriteOutcome> {
        let now_millis = self.clock.now_millis();
        tracing::debug!(
            idempotency_key = %record.idempotency_key,
            table = %self.layout.config.table_name,
            "Putting in progress record"
        );
        let result = self
            .client
            .put_item()
            .table_name(&self.layout.config.table_name)
            .set_item(Some(self.layout.in_progress_item(record)))
            .condition_expression(PUT_CONDITION)
            .set_expression_attribute_names(Some(self.layout.condition_names()))
            .set_expression_attribute_values(Some(self.layout.condition_values(now_millis)))
            .send()
            .await;

        match result {
            Ok(_) => Ok(WriteOutcome::Created),
            Err(e) if is_put_conditional_check_failed(&e) => {
                tracing::debug!(
                    idempotency_key = %record.idempotency_key,
                    "Conditional put failed, record already exists"
                );
                Ok(WriteOutcome::Conflict)
            }
            Err(e) => Err(IdempotencyError::persistence("DynamoDB PutItem failed", e)),
        }
    }

    async fn get_record(&self, key: &IdempotencyKey) -> IdempotencyResult<DataRecord> {
        let output = self
            .client
            .get_item()
            .table_name(&self.layout.config.table_name)
            .set_key(Some(self.layout.key(key)))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| IdempotencyError::persistence("DynamoDB GetItem failed", e))?;

        match output.item() {
            Some(item) => self.layout.item_to_record(item),
            None => Err(IdempotencyError::ItemNotFound {
                idempotency_key: key.clone(),
            }),
        }
    }

    async fn save_success(&self, record: &DataRecord) -> IdempotencyResult<()> {
        let (expression, names, values) = self.layout.success_update(record);
        self.client
            .update_item()
            .table_name(&self.layout.config.table_name)
            .set_key(Some(self.layout.key(&record.idempotency_key)))
            .update_expression(expression)
            .set_expression_attribute_names(Some(names))
            .set_expression_attribute_values(Some(values))
            .send()
            .await
            .map_err(|e| IdempotencyError::persistence("DynamoDB UpdateItem failed", e))?;
        Ok(())
    }

    async fn delete_record(&self, key: &IdempotencyKey) -> IdempotencyResult<()> {
        self.client
            .delete_item()
            .table_name(&self.layout.config.table_name)
            .set_key(Some(self.layout.key(key)))
            .send()
            .await
            .map_err(|e| IdempotencyError::persistence("DynamoDB DeleteItem failed", e))?;
        Ok(())
    }
}
