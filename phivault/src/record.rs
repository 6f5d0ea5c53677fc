//! Record codec: maps PHI fields onto storage columns and back.
//!
//! Each declared field is stored as a pair of columns,
//! `<field>_ciphertext` and `<field>_encrypted_dek`, plus `<field>_index`
//! when equality search is needed and `<field>_kms_key_id` when the master
//! key should be recorded per row.
//!
//! Rows are JSON objects. During a migration a row may carry the legacy
//! plaintext column, the encrypted pair, or both; the encrypted pair always
//! wins and a failure to open it is reported, never papered over with the
//! stale plaintext.

use crate::blind_index::{BlindIndexer, Normalization};
use crate::envelope::{EncryptedField, EnvelopeService};
use crate::error::Error;
use crate::gateway::KeyWrappingGateway;
use futures_util::future::try_join_all;
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::{debug, warn};

/// A database row as a JSON object.
pub type Row = Map<String, Value>;

/// How a logical field's plaintext is shaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldShape {
    /// One string value stored under the field name.
    Scalar,
    /// Several plaintext keys sealed together as one JSON object.
    Bundle(Vec<String>),
}

/// Declares one PHI-bearing field and how it is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    name: String,
    shape: FieldShape,
    index: Option<Normalization>,
    key_id_column: bool,
}

impl FieldSpec {
    /// Declares a single string field.
    #[must_use]
    pub fn scalar(name: impl Into<String>) -> Self {
        Self { name: name.into(), shape: FieldShape::Scalar, index: None, key_id_column: false }
    }

    /// Declares a bundle sealing `members` as one JSON object under `name`.
    #[must_use]
    pub fn bundle<I, S>(name: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            shape: FieldShape::Bundle(members.into_iter().map(Into::into).collect()),
            index: None,
            key_id_column: false,
        }
    }

    /// Adds an index column computed with `normalization`.
    #[must_use]
    pub const fn indexed(mut self, normalization: Normalization) -> Self {
        self.index = Some(normalization);
        self
    }

    /// Records the wrapping master key id in `<field>_kms_key_id`.
    #[must_use]
    pub const fn with_key_id_column(mut self) -> Self {
        self.key_id_column = true;
        self
    }

    /// Returns the logical field name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the field shape.
    #[must_use]
    pub const fn shape(&self) -> &FieldShape {
        &self.shape
    }

    /// Returns the index normalization, if the field is indexed.
    #[must_use]
    pub const fn index(&self) -> Option<Normalization> {
        self.index
    }

    /// Column holding the packaged ciphertext.
    #[must_use]
    pub fn ciphertext_column(&self) -> String {
        format!("{}_ciphertext", self.name)
    }

    /// Column holding the wrapped data key.
    #[must_use]
    pub fn dek_column(&self) -> String {
        format!("{}_encrypted_dek", self.name)
    }

    /// Column holding the blind index.
    #[must_use]
    pub fn index_column(&self) -> String {
        format!("{}_index", self.name)
    }

    /// Column holding the master key id.
    #[must_use]
    pub fn key_id_column(&self) -> String {
        format!("{}_kms_key_id", self.name)
    }
}

/// The encrypted pair as read from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Packaged ciphertext blob.
    pub ciphertext: String,
    /// Wrapped data key.
    pub wrapped_data_key: String,
}

/// What a row holds for one field.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredField {
    /// Neither plaintext nor ciphertext.
    Absent,
    /// Legacy plaintext only.
    Plaintext(Value),
    /// Encrypted pair only.
    Enveloped(Envelope),
    /// Both forms; the envelope takes precedence.
    Both {
        /// Legacy plaintext value.
        plaintext: Value,
        /// Encrypted pair.
        envelope: Envelope,
    },
}

impl StoredField {
    /// Reads the stored form of `field_spec` from `row`. JSON nulls count as absent.
    ///
    /// # Errors
    ///
    /// Returns `Error::Integrity` if only one half of the encrypted pair is
    /// present or either half is not a string.
    pub fn read(row: &Row, field_spec: &FieldSpec) -> Result<Self, Error> {
        let ciphertext_column = field_spec.ciphertext_column();
        let dek_column = field_spec.dek_column();

        let envelope = match (present(row, &ciphertext_column), present(row, &dek_column)) {
            (None, None) => None,
            (Some(Value::String(ciphertext)), Some(Value::String(wrapped))) => Some(Envelope {
                ciphertext: ciphertext.clone(),
                wrapped_data_key: wrapped.clone(),
            }),
            (Some(_), Some(_)) => {
                return Err(Error::Integrity(format!(
                    "`{ciphertext_column}` and `{dek_column}` must both be strings"
                )))
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(Error::Integrity(format!(
                    "`{ciphertext_column}` and `{dek_column}` must be stored together"
                )))
            }
        };

        let plaintext = match field_spec.shape {
            FieldShape::Scalar => present(row, &field_spec.name).cloned(),
            FieldShape::Bundle(_) => None,
        };

        Ok(match (plaintext, envelope) {
            (None, None) => Self::Absent,
            (Some(plaintext), None) => Self::Plaintext(plaintext),
            (None, Some(envelope)) => Self::Enveloped(envelope),
            (Some(plaintext), Some(envelope)) => Self::Both { plaintext, envelope },
        })
    }

    /// Returns the envelope to open, if any.
    #[must_use]
    pub const fn envelope(&self) -> Option<&Envelope> {
        match self {
            Self::Enveloped(envelope) | Self::Both { envelope, .. } => Some(envelope),
            Self::Absent | Self::Plaintext(_) => None,
        }
    }
}

fn present<'a>(row: &'a Row, column: &str) -> Option<&'a Value> {
    row.get(column).filter(|v| !v.is_null())
}

/// Encodes records for storage and decodes stored rows.
///
/// # Example
///
/// ```ignore
/// use phivault::prelude::*;
///
/// let codec = RecordCodec::new(
///     service,
///     vec![
///         FieldSpec::scalar("finding").indexed(Normalization::Verbatim),
///         FieldSpec::scalar("summary"),
///     ],
///     Some(BlindIndexer::from_config(&config)?),
/// )?;
///
/// let row = codec.to_storage(record).await?;
/// let record = codec.from_storage(row).await?;
/// ```
pub struct RecordCodec<G: KeyWrappingGateway> {
    service: EnvelopeService<G>,
    fields: Vec<FieldSpec>,
    indexer: Option<BlindIndexer>,
}

impl<G: KeyWrappingGateway> RecordCodec<G> {
    /// Creates a codec for `fields`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if two specs share a name, a bundle is
    /// indexed, or a field is indexed but no indexer is supplied.
    pub fn new(
        service: EnvelopeService<G>,
        fields: Vec<FieldSpec>,
        indexer: Option<BlindIndexer>,
    ) -> Result<Self, Error> {
        let mut names = HashSet::new();
        for field_spec in &fields {
            if !names.insert(field_spec.name.as_str()) {
                return Err(Error::Configuration(format!("field `{}` declared twice", field_spec.name)));
            }
            if field_spec.index.is_some() {
                if matches!(field_spec.shape, FieldShape::Bundle(_)) {
                    return Err(Error::Configuration(format!(
                        "bundle `{}` cannot be indexed",
                        field_spec.name
                    )));
                }
                if indexer.is_none() {
                    return Err(Error::Configuration(format!(
                        "field `{}` is indexed but no index key is configured",
                        field_spec.name
                    )));
                }
            }
        }
        Ok(Self { service, fields, indexer })
    }

    /// Returns the envelope service.
    #[must_use]
    pub const fn service(&self) -> &EnvelopeService<G> {
        &self.service
    }

    /// Returns the declared fields.
    #[must_use]
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Seals one value of `field` and returns its storage columns.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` for an undeclared field, and any
    /// error from sealing or indexing.
    pub async fn encode_value(&self, field: &str, plaintext: &str) -> Result<Row, Error> {
        let field_spec = self.field_spec(field)?;
        self.encode_field(field_spec, plaintext).await
    }

    /// Replaces every declared field of `record` with its storage columns.
    ///
    /// Keys that are not declared fields pass through unchanged. Missing or
    /// null fields are left out.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if a scalar field is not a string, and
    /// any error from sealing or indexing.
    pub async fn to_storage(&self, mut record: Row) -> Result<Row, Error> {
        for field_spec in &self.fields {
            let plaintext = match &field_spec.shape {
                FieldShape::Scalar => match record.remove(&field_spec.name) {
                    None | Some(Value::Null) => continue,
                    Some(Value::String(value)) => value,
                    Some(_) => {
                        return Err(Error::InvalidInput(format!(
                            "field `{}` must be a string",
                            field_spec.name
                        )))
                    }
                },
                FieldShape::Bundle(members) => {
                    let bundle: Row = members
                        .iter()
                        .filter_map(|member| record.remove(member).map(|v| (member.clone(), v)))
                        .collect();
                    if bundle.is_empty() {
                        continue;
                    }
                    Value::Object(bundle).to_string()
                }
            };

            let columns = self.encode_field(field_spec, &plaintext).await?;
            record.extend(columns);
        }
        Ok(record)
    }

    /// Opens every declared field of a stored row.
    ///
    /// Encrypted forms take precedence over legacy plaintext. Ciphertext,
    /// wrapped key and key id columns are always removed from the result.
    ///
    /// # Errors
    ///
    /// Returns `Error::Integrity` for half-present pairs or a bundle that
    /// does not decode to a JSON object, and any error from opening.
    pub async fn from_storage(&self, mut row: Row) -> Result<Row, Error> {
        for field_spec in &self.fields {
            let stored = StoredField::read(&row, field_spec)?;

            if let Some(envelope) = stored.envelope() {
                let plaintext = self
                    .service
                    .open(&envelope.ciphertext, &envelope.wrapped_data_key)
                    .await
                    .map_err(|e| {
                        warn!(field = %field_spec.name, kind = ?e.kind(), "failed to open stored field");
                        e
                    })?;

                match &field_spec.shape {
                    FieldShape::Scalar => {
                        row.insert(field_spec.name.clone(), Value::String(plaintext));
                    }
                    FieldShape::Bundle(_) => match serde_json::from_str::<Value>(&plaintext) {
                        Ok(Value::Object(members)) => row.extend(members),
                        _ => {
                            return Err(Error::Integrity(format!(
                                "bundle `{}` did not decode to a JSON object",
                                field_spec.name
                            )))
                        }
                    },
                }
            } else if matches!(stored, StoredField::Plaintext(_)) {
                debug!(field = %field_spec.name, "serving legacy plaintext column");
            }

            row.remove(&field_spec.ciphertext_column());
            row.remove(&field_spec.dek_column());
            row.remove(&field_spec.key_id_column());
        }
        Ok(row)
    }

    /// Decodes many rows concurrently, failing on the first error.
    ///
    /// # Errors
    ///
    /// See [`Self::from_storage`].
    pub async fn from_storage_all(&self, rows: Vec<Row>) -> Result<Vec<Row>, Error> {
        try_join_all(rows.into_iter().map(|row| self.from_storage(row))).await
    }

    /// Computes the query-time index tag for `value` of `field`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the field is undeclared or not
    /// indexed.
    pub fn lookup_index(&self, field: &str, value: &str) -> Result<String, Error> {
        let field_spec = self.field_spec(field)?;
        let normalization = field_spec
            .index
            .ok_or_else(|| Error::Configuration(format!("field `{field}` is not indexed")))?;
        self.indexer()?.index_value(value, normalization)
    }

    async fn encode_field(&self, field_spec: &FieldSpec, plaintext: &str) -> Result<Row, Error> {
        // Index first so a missing index key fails before the gateway is called.
        let index = match field_spec.index {
            Some(normalization) => Some(self.indexer()?.index_value(plaintext, normalization)?),
            None => None,
        };

        let EncryptedField { ciphertext, wrapped_data_key, master_key_id, .. } =
            self.service.seal(plaintext).await?;

        let mut columns = Row::new();
        columns.insert(field_spec.ciphertext_column(), Value::String(ciphertext));
        columns.insert(field_spec.dek_column(), Value::String(wrapped_data_key));
        if let Some(index) = index {
            columns.insert(field_spec.index_column(), Value::String(index));
        }
        if field_spec.key_id_column {
            columns.insert(field_spec.key_id_column(), Value::String(master_key_id));
        }
        Ok(columns)
    }

    fn field_spec(&self, field: &str) -> Result<&FieldSpec, Error> {
        self.fields
            .iter()
            .find(|field_spec| field_spec.name == field)
            .ok_or_else(|| Error::Configuration(format!("field `{field}` is not declared")))
    }

    fn indexer(&self) -> Result<&BlindIndexer, Error> {
        self.indexer
            .as_ref()
            .ok_or_else(|| Error::Configuration("no index key is configured".to_string()))
    }
}
