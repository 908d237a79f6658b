//! Citation tokens and the snapshot rewrite that mints them.
//!
//! Before a site snapshot is shown to the model, every value that can be traced
//! to a source PDF has its `document` replaced by an opaque token such as
//! `CITESITE1-C`, and its bounding boxes are dropped. The model cites tokens in
//! its answer; the [`CitationTable`] built alongside the rewrite turns them
//! back into document + bounding-box provenance.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::docs::types::{FieldNode, FieldValue, LeaseFields};
use crate::error::{Error, Result};
use crate::snapshot::SiteSnapshot;

const TOKEN_PREFIX: &str = "CITE";

/// Spreadsheet column name for a 1-based index: 1 → `A`, 26 → `Z`, 27 → `AA`.
pub fn column_name(mut number: usize) -> String {
    let mut letters = Vec::new();
    while number > 0 {
        number -= 1;
        letters.push(b'A' + (number % 26) as u8);
        number /= 26;
    }
    letters.reverse();
    String::from_utf8_lossy(&letters).into_owned()
}

/// A citation token of the form `CITE<site_id>-<alias>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CitationToken {
    site_id: String,
    alias: String,
}

impl CitationToken {
    pub fn new(site_id: &str, alias: &str) -> Self {
        Self {
            site_id: site_id.to_string(),
            alias: alias.to_string(),
        }
    }

    /// Parse a token as the model emitted it.
    ///
    /// Accepts a bare token or a JSON-encoded list whose first element is the
    /// token (`["CITE1-A"]`). The site id runs from after `CITE` up to the
    /// first `-`.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = || Error::InvalidCitation(raw.to_string());
        let trimmed = raw.trim();

        let unwrapped;
        let text = if trimmed.starts_with('[') && trimmed.ends_with(']') {
            let list: Vec<String> = serde_json::from_str(trimmed).map_err(|_| invalid())?;
            unwrapped = list.into_iter().next().ok_or_else(invalid)?;
            unwrapped.trim()
        } else {
            trimmed
        };

        let rest = text.strip_prefix(TOKEN_PREFIX).ok_or_else(invalid)?;
        let (site_id, alias) = rest.split_once('-').ok_or_else(invalid)?;
        if site_id.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(site_id, alias))
    }

    /// Check that tokens minted for `site_id` will parse back to it.
    pub fn check_site_id(site_id: &str) -> Result<()> {
        if site_id.is_empty() || site_id.contains('-') {
            return Err(Error::InvalidSiteId(site_id.to_string()));
        }
        Ok(())
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }
}

impl fmt::Display for CitationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}-{}", TOKEN_PREFIX, self.site_id, self.alias)
    }
}

/// Provenance recorded for a minted token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationMapping {
    pub source_document: String,
    pub source_bounding_boxes: Option<String>,
}

/// Reverse lookup from token text to provenance, one per snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CitationTable {
    mappings: HashMap<String, CitationMapping>,
}

impl CitationTable {
    pub fn get(&self, token: &CitationToken) -> Option<&CitationMapping> {
        self.mappings.get(&token.to_string())
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    fn insert(&mut self, token: &CitationToken, mapping: CitationMapping) {
        self.mappings.insert(token.to_string(), mapping);
    }
}

/// Rewrites snapshots into their model-facing form.
#[derive(Debug, Clone, Copy, Default)]
pub struct CitationMapper;

impl CitationMapper {
    pub fn new() -> Self {
        Self
    }

    /// Produce the model-facing document and its citation table.
    ///
    /// The snapshot is only read. Leases are visited in order and field
    /// members in key order, with one alias counter for the whole snapshot, so
    /// the same snapshot always yields the same tokens.
    pub fn process(&self, snapshot: &SiteSnapshot) -> (Value, CitationTable) {
        let mut minter = TokenMinter::new(&snapshot.site_id);

        let unstructured: Vec<Value> = snapshot
            .leases_from_unstructured_data
            .iter()
            .map(|lease| {
                let mut record = Map::new();
                if let Some(lease_id) = &lease.lease_id {
                    record.insert("lease_id".to_string(), json!(lease_id));
                }
                record.insert(
                    "fields".to_string(),
                    Value::Object(minter.rewrite_fields(&lease.fields)),
                );
                Value::Object(record)
            })
            .collect();

        let structured: Vec<Value> = snapshot
            .leases_from_structured_data
            .iter()
            .map(strip_type_tags)
            .collect();

        let document = json!({
            "_id": snapshot.site_id,
            "lease_config_hash": snapshot.lease_config_hash,
            "leases_from_structured_data": structured,
            "leases_from_unstructured_data": unstructured,
        });
        (document, minter.table)
    }
}

struct TokenMinter<'a> {
    site_id: &'a str,
    next_alias: usize,
    table: CitationTable,
}

impl<'a> TokenMinter<'a> {
    fn new(site_id: &'a str) -> Self {
        Self {
            site_id,
            next_alias: 1,
            table: CitationTable::default(),
        }
    }

    fn mint(&mut self, source_document: &str, source_bounding_boxes: Option<&str>) -> String {
        let token = CitationToken::new(self.site_id, &column_name(self.next_alias));
        self.next_alias += 1;
        self.table.insert(
            &token,
            CitationMapping {
                source_document: source_document.to_string(),
                source_bounding_boxes: source_bounding_boxes.map(str::to_string),
            },
        );
        token.to_string()
    }

    /// Fields left with no values are dropped.
    fn rewrite_fields(&mut self, fields: &LeaseFields) -> Map<String, Value> {
        let mut out = Map::new();
        for (name, nodes) in fields {
            let values: Vec<Value> = nodes
                .iter()
                .filter_map(|node| self.rewrite_node(node, None))
                .collect();
            if !values.is_empty() {
                out.insert(name.clone(), Value::Array(values));
            }
        }
        out
    }

    /// Returns `None` for nodes with no value, which are pruned by the caller.
    ///
    /// Containers pass their source document down to their children and are
    /// never tokenized themselves; an inherited document wins over the node's
    /// own.
    fn rewrite_node(&mut self, node: &FieldNode, inherited: Option<&str>) -> Option<Value> {
        let value = node.value.as_ref()?;
        let document = inherited.or_else(|| node.provenance.document());
        let mut out = Map::new();

        match value {
            FieldValue::Array(items) => {
                let items: Vec<Value> = items
                    .iter()
                    .filter_map(|item| self.rewrite_node(item, document))
                    .collect();
                out.insert(value.json_key().to_string(), Value::Array(items));
                emit_untokenized_provenance(node, document, &mut out);
            }
            FieldValue::Object(members) => {
                let mut rewritten = Map::new();
                for (name, member) in members {
                    if let Some(member) = self.rewrite_node(member, document) {
                        rewritten.insert(name.clone(), member);
                    }
                }
                out.insert(value.json_key().to_string(), Value::Object(rewritten));
                emit_untokenized_provenance(node, document, &mut out);
            }
            scalar => {
                out.insert(scalar.json_key().to_string(), scalar_json(scalar));
                if let Some(date) = node.date_of_document {
                    out.insert("date_of_document".to_string(), json!(date.to_string()));
                }
                match document {
                    Some(document) => {
                        let token = self.mint(document, node.provenance.source.as_deref());
                        out.insert("document".to_string(), Value::String(token));
                    }
                    None => {
                        if let Some(source) = &node.provenance.source {
                            out.insert("source".to_string(), json!(source));
                        }
                    }
                }
            }
        }
        Some(Value::Object(out))
    }
}

/// A container with no document anywhere above it keeps its raw source;
/// one with a document has handed it to its children.
fn emit_untokenized_provenance(
    node: &FieldNode,
    document: Option<&str>,
    out: &mut Map<String, Value>,
) {
    if let Some(date) = node.date_of_document {
        out.insert("date_of_document".to_string(), json!(date.to_string()));
    }
    if document.is_none() {
        if let Some(source) = &node.provenance.source {
            out.insert("source".to_string(), json!(source));
        }
    }
}

fn scalar_json(value: &FieldValue) -> Value {
    match value {
        FieldValue::String(s) | FieldValue::Date(s) | FieldValue::Time(s) => json!(s),
        FieldValue::Number(n) => json!(n),
        FieldValue::Integer(i) => json!(i),
        FieldValue::Array(_) | FieldValue::Object(_) => Value::Null,
    }
}

/// Structured-data leases carry no citations; only their `type` tags go.
fn strip_type_tags(lease: &Value) -> Value {
    let mut lease = lease.clone();
    if let Some(fields) = lease.get_mut("fields").and_then(Value::as_object_mut) {
        for field in fields.values_mut() {
            match field {
                Value::Object(obj) => {
                    obj.remove("type");
                }
                Value::Array(items) => {
                    for item in items.iter_mut().filter_map(Value::as_object_mut) {
                        item.remove("type");
                    }
                }
                _ => {}
            }
        }
    }
    lease
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docs::types::{LeaseRecord, Provenance};
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn leaf(value: FieldValue, document: Option<&str>, source: Option<&str>) -> FieldNode {
        FieldNode::leaf(value, document, source)
    }

    fn string(s: &str) -> FieldValue {
        FieldValue::String(s.to_string())
    }

    fn snapshot(site_id: &str, leases: Vec<LeaseRecord>) -> SiteSnapshot {
        SiteSnapshot {
            leases_from_unstructured_data: leases,
            ..SiteSnapshot::empty(site_id, "fake_hash")
        }
    }

    fn lease(id: Option<&str>, fields: Vec<(&str, Vec<FieldNode>)>) -> LeaseRecord {
        LeaseRecord {
            lease_id: id.map(str::to_string),
            fields: fields
                .into_iter()
                .map(|(name, nodes)| (name.to_string(), nodes))
                .collect(),
        }
    }

    #[test]
    fn test_column_name() {
        assert_eq!(column_name(1), "A");
        assert_eq!(column_name(5), "E");
        assert_eq!(column_name(26), "Z");
        assert_eq!(column_name(27), "AA");
        assert_eq!(column_name(52), "AZ");
        assert_eq!(column_name(703), "AAA");
    }

    #[test]
    fn test_parse_token() {
        let token = CitationToken::parse("CITE3OAS074ACOS-C").unwrap();
        assert_eq!(token.site_id(), "3OAS074ACOS");
        assert_eq!(token.alias(), "C");
        assert_eq!(token.to_string(), "CITE3OAS074ACOS-C");
    }

    #[test]
    fn test_parse_token_wrapped_in_list() {
        let token = CitationToken::parse(r#"["CITE1-AB"]"#).unwrap();
        assert_eq!(token.site_id(), "1");
        assert_eq!(token.alias(), "AB");
    }

    #[test]
    fn test_parse_token_rejects_malformed() {
        for raw in ["not-a-token", "CITE1A", "CITE-A", "['CITE1-A']", "[]", "", "[1]"] {
            let err = CitationToken::parse(raw).unwrap_err();
            assert!(matches!(err, Error::InvalidCitation(_)), "{raw}");
        }
    }

    #[test]
    fn test_rewrite_scalar_fields() {
        let dated = |value, doc: &str, day| FieldNode {
            date_of_document: NaiveDate::from_ymd_opt(2023, 10, day),
            ..leaf(value, Some(doc), Some("D(1,1,1,1,1,1,1,1)"))
        };
        let snap = snapshot(
            "3OAS074ACOS",
            vec![lease(
                Some("68313"),
                vec![
                    (
                        "Current_Rent_Amount",
                        vec![dated(FieldValue::Number(18658.829), "/docs/b_AMD.pdf", 2)],
                    ),
                    (
                        "Lease",
                        vec![dated(FieldValue::Integer(68313), "/docs/a_LSE.pdf", 1)],
                    ),
                    (
                        "Name",
                        vec![
                            dated(string("1 -  Rooftop"), "/docs/a_LSE.pdf", 1),
                            dated(string("2 -  Rooftop"), "/docs/b_AMD.pdf", 1),
                        ],
                    ),
                ],
            )],
        );

        let (document, table) = CitationMapper::new().process(&snap);

        assert_eq!(
            document,
            json!({
                "_id": "3OAS074ACOS",
                "lease_config_hash": "fake_hash",
                "leases_from_structured_data": [],
                "leases_from_unstructured_data": [{
                    "lease_id": "68313",
                    "fields": {
                        "Current_Rent_Amount": [{
                            "valueNumber": 18658.829,
                            "date_of_document": "2023-10-02",
                            "document": "CITE3OAS074ACOS-A"
                        }],
                        "Lease": [{
                            "valueInteger": 68313,
                            "date_of_document": "2023-10-01",
                            "document": "CITE3OAS074ACOS-B"
                        }],
                        "Name": [
                            {
                                "valueString": "1 -  Rooftop",
                                "date_of_document": "2023-10-01",
                                "document": "CITE3OAS074ACOS-C"
                            },
                            {
                                "valueString": "2 -  Rooftop",
                                "date_of_document": "2023-10-01",
                                "document": "CITE3OAS074ACOS-D"
                            }
                        ]
                    }
                }]
            })
        );
        assert_eq!(table.len(), 4);
        assert_eq!(
            table.get(&CitationToken::parse("CITE3OAS074ACOS-A").unwrap()),
            Some(&CitationMapping {
                source_document: "/docs/b_AMD.pdf".to_string(),
                source_bounding_boxes: Some("D(1,1,1,1,1,1,1,1)".to_string()),
            })
        );
    }

    #[test]
    fn test_rewrite_nested_array_inherits_document() {
        let item = |make: Option<&str>, quantity: Option<&str>| {
            let mut members = BTreeMap::new();
            members.insert(
                "make".to_string(),
                match make {
                    Some(m) => leaf(string(m), None, Some("D(1,3)")),
                    None => FieldNode::default(),
                },
            );
            members.insert(
                "quantity".to_string(),
                match quantity {
                    Some(q) => leaf(string(q), None, Some("D(1,4)")),
                    None => FieldNode::default(),
                },
            );
            FieldNode {
                value: Some(FieldValue::Object(members)),
                ..Default::default()
            }
        };
        let equipment = FieldNode {
            value: Some(FieldValue::Array(vec![
                item(Some("Make1"), Some("10")),
                item(None, Some("11")),
                item(Some("Make2"), None),
                item(None, None),
            ])),
            provenance: Provenance {
                document: Some("/docs/equipment.pdf".to_string()),
                ..Default::default()
            },
            date_of_document: None,
        };
        let snap = snapshot(
            "4OAS074AARR",
            vec![lease(Some("68313"), vec![("equipment", vec![equipment])])],
        );

        let (document, table) = CitationMapper::new().process(&snap);

        assert_eq!(
            document["leases_from_unstructured_data"][0]["fields"]["equipment"],
            json!([{
                "valueArray": [
                    {"valueObject": {
                        "make": {"valueString": "Make1", "document": "CITE4OAS074AARR-A"},
                        "quantity": {"valueString": "10", "document": "CITE4OAS074AARR-B"}
                    }},
                    {"valueObject": {
                        "quantity": {"valueString": "11", "document": "CITE4OAS074AARR-C"}
                    }},
                    {"valueObject": {
                        "make": {"valueString": "Make2", "document": "CITE4OAS074AARR-D"}
                    }},
                    {"valueObject": {}}
                ]
            }])
        );
        let quantity = table
            .get(&CitationToken::parse("CITE4OAS074AARR-C").unwrap())
            .unwrap();
        assert_eq!(quantity.source_document, "/docs/equipment.pdf");
        assert_eq!(quantity.source_bounding_boxes.as_deref(), Some("D(1,4)"));
    }

    #[test]
    fn test_nodes_without_document_pass_through() {
        let snap = snapshot(
            "S1",
            vec![lease(
                None,
                vec![
                    ("Name", vec![leaf(string("Rooftop"), None, Some("D(2,2)"))]),
                    ("Empty", vec![FieldNode::default()]),
                ],
            )],
        );

        let (document, table) = CitationMapper::new().process(&snap);

        assert!(table.is_empty());
        assert_eq!(
            document["leases_from_unstructured_data"],
            json!([{"fields": {"Name": [{"valueString": "Rooftop", "source": "D(2,2)"}]}}])
        );
    }

    #[test]
    fn test_alias_counter_spans_leases() {
        let field = |doc: &str| vec![("Name", vec![leaf(string("x"), Some(doc), None)])];
        let snap = snapshot(
            "S1",
            vec![lease(Some("1"), field("a.pdf")), lease(Some("2"), field("b.pdf"))],
        );

        let (_, table) = CitationMapper::new().process(&snap);

        assert_eq!(table.len(), 2);
        assert_eq!(
            table.get(&CitationToken::new("S1", "B")).unwrap().source_document,
            "b.pdf"
        );
    }

    #[test]
    fn test_process_is_deterministic_and_leaves_input_untouched() {
        let snap = snapshot(
            "S1",
            vec![lease(
                Some("1"),
                vec![("Name", vec![leaf(string("x"), Some("a.pdf"), Some("D(1)"))])],
            )],
        );
        let before = snap.clone();
        let mapper = CitationMapper::new();

        let first = mapper.process(&snap);
        let second = mapper.process(&snap);

        assert_eq!(first, second);
        assert_eq!(snap, before);
    }

    #[test]
    fn test_empty_snapshot() {
        let (document, table) = CitationMapper::new().process(&SiteSnapshot::empty("S1", "h"));
        assert!(table.is_empty());
        assert_eq!(document["leases_from_structured_data"], json!([]));
        assert_eq!(document["leases_from_unstructured_data"], json!([]));
    }

    #[test]
    fn test_structured_data_loses_type_tags() {
        let mut snap = SiteSnapshot::empty("S1", "h");
        snap.leases_from_structured_data = vec![json!({
            "lease_id": "9",
            "fields": {
                "Rent": {"type": "number", "value": 10.5},
                "Parties": [{"type": "string", "value": "A"}, {"type": "string", "value": "B"}]
            }
        })];

        let (document, _) = CitationMapper::new().process(&snap);

        assert_eq!(
            document["leases_from_structured_data"],
            json!([{
                "lease_id": "9",
                "fields": {
                    "Rent": {"value": 10.5},
                    "Parties": [{"value": "A"}, {"value": "B"}]
                }
            }])
        );
    }

    #[test]
    fn test_round_trip_every_minted_token() {
        let snap = snapshot(
            "S7",
            (0..30)
                .map(|i| {
                    let doc = format!("doc{}.pdf", i);
                    let src = format!("D({})", i);
                    lease(
                        Some(i.to_string().as_str()),
                        vec![(
                            "Name",
                            vec![leaf(string("v"), Some(doc.as_str()), Some(src.as_str()))],
                        )],
                    )
                })
                .collect(),
        );

        let (document, table) = CitationMapper::new().process(&snap);

        assert_eq!(table.len(), 30);
        for (i, lease) in document["leases_from_unstructured_data"]
            .as_array()
            .unwrap()
            .iter()
            .enumerate()
        {
            let token = lease["fields"]["Name"][0]["document"].as_str().unwrap();
            let mapping = table.get(&CitationToken::parse(token).unwrap()).unwrap();
            assert_eq!(mapping.source_document, format!("doc{}.pdf", i));
            assert_eq!(mapping.source_bounding_boxes, Some(format!("D({})", i)));
        }
    }
}
