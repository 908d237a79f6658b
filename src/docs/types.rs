use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Value type declared by the extraction service for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Date,
    Time,
    Array,
    Object,
}

/// A field record exactly as the extraction store persists it.
///
/// Only one `value*` slot is expected to be populated; [`FieldNode::try_from`]
/// enforces that and checks it against the declared `type`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedField {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<FieldType>,
    #[serde(rename = "valueString", default, skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
    #[serde(rename = "valueNumber", default, skip_serializing_if = "Option::is_none")]
    pub value_number: Option<f64>,
    #[serde(rename = "valueInteger", default, skip_serializing_if = "Option::is_none")]
    pub value_integer: Option<i64>,
    #[serde(rename = "valueDate", default, skip_serializing_if = "Option::is_none")]
    pub value_date: Option<String>,
    #[serde(rename = "valueTime", default, skip_serializing_if = "Option::is_none")]
    pub value_time: Option<String>,
    #[serde(rename = "valueArray", default, skip_serializing_if = "Option::is_none")]
    pub value_array: Option<Vec<ExtractedField>>,
    #[serde(rename = "valueObject", default, skip_serializing_if = "Option::is_none")]
    pub value_object: Option<BTreeMap<String, ExtractedField>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spans: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Bounding-box spans, e.g. `D(1,0.5,0.5,...)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_document: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markdown: Option<String>,
    /// Path of the source PDF the value was extracted from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdocument_start_page: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdocument_end_page: Option<i64>,
}

/// The typed value carried by a [`FieldNode`].
///
/// Children are owned, so a field document is always a tree.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    Number(f64),
    Integer(i64),
    Date(String),
    Time(String),
    Array(Vec<FieldNode>),
    Object(BTreeMap<String, FieldNode>),
}

impl FieldValue {
    pub fn kind(&self) -> FieldType {
        match self {
            FieldValue::String(_) => FieldType::String,
            FieldValue::Number(_) => FieldType::Number,
            FieldValue::Integer(_) => FieldType::Integer,
            FieldValue::Date(_) => FieldType::Date,
            FieldValue::Time(_) => FieldType::Time,
            FieldValue::Array(_) => FieldType::Array,
            FieldValue::Object(_) => FieldType::Object,
        }
    }

    /// Key this value is published under in the model-facing document.
    pub fn json_key(&self) -> &'static str {
        match self {
            FieldValue::String(_) => "valueString",
            FieldValue::Number(_) => "valueNumber",
            FieldValue::Integer(_) => "valueInteger",
            FieldValue::Date(_) => "valueDate",
            FieldValue::Time(_) => "valueTime",
            FieldValue::Array(_) => "valueArray",
            FieldValue::Object(_) => "valueObject",
        }
    }
}

/// Where a value came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Provenance {
    pub document: Option<String>,
    pub source: Option<String>,
    pub confidence: Option<f64>,
}

impl Provenance {
    /// The source document, ignoring empty identifiers.
    pub fn document(&self) -> Option<&str> {
        self.document.as_deref().filter(|d| !d.is_empty())
    }
}

/// A validated lease field node.
///
/// `value` is `None` when the extraction service found nothing; such nodes
/// are pruned before the document reaches the model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldNode {
    pub value: Option<FieldValue>,
    pub provenance: Provenance,
    pub date_of_document: Option<NaiveDate>,
}

impl FieldNode {
    pub fn leaf(value: FieldValue, document: Option<&str>, source: Option<&str>) -> Self {
        Self {
            value: Some(value),
            provenance: Provenance {
                document: document.map(str::to_string),
                source: source.map(str::to_string),
                confidence: None,
            },
            date_of_document: None,
        }
    }
}

impl TryFrom<ExtractedField> for FieldNode {
    type Error = Error;

    fn try_from(raw: ExtractedField) -> Result<Self> {
        let mut values = Vec::new();
        if let Some(v) = raw.value_string {
            values.push(FieldValue::String(v));
        }
        if let Some(v) = raw.value_number {
            values.push(FieldValue::Number(v));
        }
        if let Some(v) = raw.value_integer {
            values.push(FieldValue::Integer(v));
        }
        if let Some(v) = raw.value_date {
            values.push(FieldValue::Date(v));
        }
        if let Some(v) = raw.value_time {
            values.push(FieldValue::Time(v));
        }
        if let Some(items) = raw.value_array {
            let items = items
                .into_iter()
                .map(FieldNode::try_from)
                .collect::<Result<Vec<_>>>()?;
            values.push(FieldValue::Array(items));
        }
        if let Some(members) = raw.value_object {
            let members = members
                .into_iter()
                .map(|(name, field)| Ok((name, FieldNode::try_from(field)?)))
                .collect::<Result<BTreeMap<_, _>>>()?;
            values.push(FieldValue::Object(members));
        }

        if values.len() > 1 {
            let kinds: Vec<FieldType> = values.iter().map(FieldValue::kind).collect();
            return Err(Error::InvalidField(format!(
                "more than one value populated: {:?}",
                kinds
            )));
        }
        let value = values.pop();

        if let (Some(declared), Some(value)) = (raw.field_type, value.as_ref()) {
            if declared != value.kind() {
                return Err(Error::InvalidField(format!(
                    "declared type {:?} but carries a {:?} value",
                    declared,
                    value.kind()
                )));
            }
        }

        Ok(FieldNode {
            value,
            provenance: Provenance {
                document: raw.document,
                source: raw.source,
                confidence: raw.confidence,
            },
            date_of_document: raw.date_of_document,
        })
    }
}

/// Field name → every value extracted for it, one per source document.
pub type LeaseFields = BTreeMap<String, Vec<FieldNode>>;

/// The extracted fields of one lease.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeaseRecord {
    pub lease_id: Option<String>,
    pub fields: LeaseFields,
}

/// A lease as stored by the extraction pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedLease {
    #[serde(default)]
    pub lease_id: Option<String>,
    #[serde(default)]
    pub original_documents: Vec<String>,
    #[serde(default)]
    pub markdowns: Vec<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, Vec<ExtractedField>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedSiteInformation {
    #[serde(default)]
    pub leases: Vec<ExtractedLease>,
}

/// The stored extraction result for one site under one lease configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedSiteCollection {
    #[serde(rename = "_id")]
    pub id: String,
    pub site_id: String,
    #[serde(default)]
    pub config_id: String,
    pub lease_config_hash: String,
    pub information: ExtractedSiteInformation,
}
