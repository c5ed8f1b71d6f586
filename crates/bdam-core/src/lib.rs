//! Core domain model for BDAM: webhook envelopes, CRM records, field codes.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "bdam-core";

/// Bitrix custom-field codes consumed by the mirror.
///
/// The codes are portal-specific and opaque; everything downstream refers to
/// them through these names.
pub mod fields {
    /// "Maximum priority" list field on the deal; yes/no option ids below.
    pub const PRIORITY_FLAG: &str = "UF_CRM_1761801450";
    pub const DELIVERY_DEADLINE: &str = "UF_CRM_1761286788";
    pub const RETURN_TYPE: &str = "UF_CRM_1761285087347";
    pub const DEMAND_TYPE: &str = "UF_CRM_1761285615045";
    pub const EXECUTOR_CODE: &str = "UF_CRM_1761700821514";
    pub const EXECUTOR: &str = "UF_CRM_1761287067";
    pub const REVISION_REASON: &str = "UF_CRM_1761801018723";
    pub const COMPLETION_NOTE: &str = "UF_CRM_1761288771741";
    pub const DECLINE_REASON: &str = "UF_CRM_1761702301803";
    /// On the company entity: short prefix used for sequential deal titles.
    pub const COMPANY_TAG: &str = "UF_CRM_1763424498916";
}

/// Option id meaning "yes" on the priority list field.
pub const PRIORITY_YES: &str = "185";
/// Option id meaning "no" on the priority list field.
pub const PRIORITY_NO: &str = "187";
/// Title prefix carried by priority deals, separator included.
pub const PRIORITY_MARKER: &str = "\u{2668}\u{fe0f} ";

/// Webhook event names the router acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    DealAdd,
    DealUpdate,
    DealDelete,
    CompanyDelete,
    Other,
}

impl EventKind {
    pub fn classify(event: &str) -> Self {
        match event {
            "ONCRMDEALADD" => Self::DealAdd,
            "ONCRMDEALUPDATE" => Self::DealUpdate,
            "ONCRMDEALDELETE" => Self::DealDelete,
            "ONCRMCOMPANYDELETE" => Self::CompanyDelete,
            _ => Self::Other,
        }
    }
}

/// Inbound webhook body reduced to the two values the router needs.
///
/// Bitrix posts either JSON or a form-encoded body depending on portal
/// configuration; both collapse to `event` plus the nested entity id.
/// A missing field stays `None`; the router treats that as a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WebhookPayload {
    pub event: Option<String>,
    pub entity_id: Option<String>,
}

impl WebhookPayload {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Pick the parser from the content type, falling back to sniffing the
    /// first byte (a JSON body always opens with `{`).
    pub fn parse(content_type: Option<&str>, body: &[u8]) -> Self {
        let looks_json = content_type.is_some_and(|ct| ct.contains("json"))
            || body.first().is_some_and(|b| *b == b'{');
        if looks_json {
            match serde_json::from_slice::<JsonValue>(body) {
                Ok(value) => Self::from_json(&value),
                Err(_) => Self::empty(),
            }
        } else {
            Self::from_form(body)
        }
    }

    pub fn from_json(value: &JsonValue) -> Self {
        let event = value
            .get("event")
            .and_then(JsonValue::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let entity_id = value.pointer("/data/FIELDS/ID").and_then(json_id);
        Self { event, entity_id }
    }

    pub fn from_form(body: &[u8]) -> Self {
        let mut payload = Self::empty();
        for (key, value) in url::form_urlencoded::parse(body) {
            match key.as_ref() {
                "event" if !value.is_empty() => payload.event = Some(value.into_owned()),
                "data[FIELDS][ID]" if !value.is_empty() => {
                    payload.entity_id = Some(value.into_owned());
                }
                _ => {}
            }
        }
        payload
    }
}

fn json_id(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Full deal record as returned by `crm.deal.get`.
///
/// Bitrix serializes absent custom fields as `false`, empty string, or null
/// depending on field type, so every optional field goes through the lenient
/// deserializer and collapses to `None` on anything unusable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealRecord {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "TITLE", default)]
    pub title: String,
    #[serde(rename = "STAGE_ID", default, deserialize_with = "lenient_string")]
    pub stage_id: Option<String>,
    #[serde(rename = "OPPORTUNITY", default, deserialize_with = "lenient_string")]
    pub opportunity: Option<String>,
    #[serde(rename = "ASSIGNED_BY_ID", default, deserialize_with = "lenient_string")]
    pub assigned_by_id: Option<String>,
    #[serde(rename = "CREATED_BY_ID", default, deserialize_with = "lenient_string")]
    pub created_by_id: Option<String>,
    #[serde(rename = "SOURCE_ID", default, deserialize_with = "lenient_string")]
    pub source_id: Option<String>,
    #[serde(rename = "COMPANY_ID", default, deserialize_with = "lenient_string")]
    pub company_id: Option<String>,
    #[serde(rename = "CONTACT_ID", default, deserialize_with = "lenient_string")]
    pub contact_id: Option<String>,
    #[serde(rename = "DATE_CREATE", default, deserialize_with = "lenient_string")]
    pub date_create: Option<String>,
    #[serde(rename = "DATE_MODIFY", default, deserialize_with = "lenient_string")]
    pub date_modify: Option<String>,
    /// 'Y' when the deal is closed.
    #[serde(rename = "CLOSED", default, deserialize_with = "lenient_string")]
    pub closed: Option<String>,
    #[serde(rename = "UF_CRM_1761801450", default, deserialize_with = "lenient_string")]
    pub priority_flag: Option<String>,
    #[serde(rename = "UF_CRM_1761286788", default, deserialize_with = "lenient_string")]
    pub delivery_deadline: Option<String>,
    #[serde(rename = "UF_CRM_1761285087347", default, deserialize_with = "lenient_string")]
    pub return_type: Option<String>,
    #[serde(rename = "UF_CRM_1761285615045", default, deserialize_with = "lenient_string")]
    pub demand_type: Option<String>,
    #[serde(rename = "UF_CRM_1761700821514", default, deserialize_with = "lenient_string")]
    pub executor_code: Option<String>,
    #[serde(rename = "UF_CRM_1761287067", default, deserialize_with = "lenient_string")]
    pub executor: Option<String>,
    #[serde(rename = "UF_CRM_1761801018723", default, deserialize_with = "lenient_string")]
    pub revision_reason: Option<String>,
    #[serde(rename = "UF_CRM_1761288771741", default, deserialize_with = "lenient_string")]
    pub completion_note: Option<String>,
    #[serde(rename = "UF_CRM_1761702301803", default, deserialize_with = "lenient_string")]
    pub decline_reason: Option<String>,
}

/// Company record as returned by `crm.company.get`; only the fields the tag
/// automation reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyRecord {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "TITLE", default, deserialize_with = "lenient_string")]
    pub title: Option<String>,
    #[serde(rename = "UF_CRM_1763424498916", default, deserialize_with = "lenient_string")]
    pub tag: Option<String>,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    Ok(match value {
        JsonValue::String(s) if !s.is_empty() => Some(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_tracked_events() {
        assert_eq!(EventKind::classify("ONCRMDEALADD"), EventKind::DealAdd);
        assert_eq!(EventKind::classify("ONCRMDEALUPDATE"), EventKind::DealUpdate);
        assert_eq!(EventKind::classify("ONCRMDEALDELETE"), EventKind::DealDelete);
        assert_eq!(EventKind::classify("ONCRMCOMPANYDELETE"), EventKind::CompanyDelete);
        assert_eq!(EventKind::classify("ONCRMLEADADD"), EventKind::Other);
        assert_eq!(EventKind::classify(""), EventKind::Other);
    }

    #[test]
    fn json_payload_extracts_event_and_id() {
        let payload = WebhookPayload::from_json(&json!({
            "event": "ONCRMDEALUPDATE",
            "data": { "FIELDS": { "ID": "97" } }
        }));
        assert_eq!(payload.event.as_deref(), Some("ONCRMDEALUPDATE"));
        assert_eq!(payload.entity_id.as_deref(), Some("97"));
    }

    #[test]
    fn json_payload_accepts_numeric_id() {
        let payload = WebhookPayload::from_json(&json!({
            "event": "ONCRMDEALADD",
            "data": { "FIELDS": { "ID": 42 } }
        }));
        assert_eq!(payload.entity_id.as_deref(), Some("42"));
    }

    #[test]
    fn missing_event_or_id_stays_none() {
        let no_event = WebhookPayload::from_json(&json!({ "data": { "FIELDS": { "ID": "7" } } }));
        assert_eq!(no_event.event, None);
        assert_eq!(no_event.entity_id.as_deref(), Some("7"));

        let no_id = WebhookPayload::from_json(&json!({ "event": "ONCRMDEALADD", "data": {} }));
        assert_eq!(no_id.entity_id, None);

        let empty_id = WebhookPayload::from_json(&json!({
            "event": "ONCRMDEALADD",
            "data": { "FIELDS": { "ID": "" } }
        }));
        assert_eq!(empty_id.entity_id, None);
    }

    #[test]
    fn form_payload_parses_bracketed_keys() {
        let body = b"event=ONCRMDEALADD&data%5BFIELDS%5D%5BID%5D=12&ts=1700000000";
        let payload = WebhookPayload::from_form(body);
        assert_eq!(payload.event.as_deref(), Some("ONCRMDEALADD"));
        assert_eq!(payload.entity_id.as_deref(), Some("12"));

        let raw_brackets = b"event=ONCRMDEALDELETE&data[FIELDS][ID]=42";
        let payload = WebhookPayload::from_form(raw_brackets);
        assert_eq!(payload.event.as_deref(), Some("ONCRMDEALDELETE"));
        assert_eq!(payload.entity_id.as_deref(), Some("42"));
    }

    #[test]
    fn parse_switches_on_content_type_and_shape() {
        let json_body = br#"{"event":"ONCRMDEALADD","data":{"FIELDS":{"ID":"1"}}}"#;
        let parsed = WebhookPayload::parse(Some("application/json"), json_body);
        assert_eq!(parsed.event.as_deref(), Some("ONCRMDEALADD"));

        // No content type, but the body shape gives it away.
        let sniffed = WebhookPayload::parse(None, json_body);
        assert_eq!(sniffed.entity_id.as_deref(), Some("1"));

        let form_body = b"event=ONCRMCOMPANYDELETE&data[FIELDS][ID]=9";
        let parsed = WebhookPayload::parse(Some("application/x-www-form-urlencoded"), form_body);
        assert_eq!(parsed.event.as_deref(), Some("ONCRMCOMPANYDELETE"));
        assert_eq!(parsed.entity_id.as_deref(), Some("9"));

        let garbage = WebhookPayload::parse(Some("application/json"), b"{not json");
        assert_eq!(garbage, WebhookPayload::empty());
    }

    #[test]
    fn deal_record_tolerates_bitrix_field_shapes() {
        let deal: DealRecord = serde_json::from_value(json!({
            "ID": "97",
            "TITLE": "Fix bug",
            "STAGE_ID": "NEW",
            "OPPORTUNITY": false,
            "ASSIGNED_BY_ID": 12,
            "COMPANY_ID": "345",
            "CLOSED": "N",
            "UF_CRM_1761801450": "185",
            "UF_CRM_1761285087347": "",
            "UF_CRM_1761287067": null
        }))
        .expect("deal record");

        assert_eq!(deal.id, "97");
        assert_eq!(deal.title, "Fix bug");
        assert_eq!(deal.opportunity, None);
        assert_eq!(deal.assigned_by_id.as_deref(), Some("12"));
        assert_eq!(deal.company_id.as_deref(), Some("345"));
        assert_eq!(deal.closed.as_deref(), Some("N"));
        assert_eq!(deal.priority_flag.as_deref(), Some(PRIORITY_YES));
        assert_eq!(deal.return_type, None);
        assert_eq!(deal.executor, None);
        assert_eq!(deal.created_by_id, None);
    }

    #[test]
    fn company_record_reads_tag_field() {
        let company: CompanyRecord = serde_json::from_value(json!({
            "ID": "345",
            "TITLE": "Appex Ltda",
            "UF_CRM_1763424498916": "APP"
        }))
        .expect("company record");
        assert_eq!(company.tag.as_deref(), Some("APP"));

        let untagged: CompanyRecord = serde_json::from_value(json!({
            "ID": "346",
            "TITLE": "No Tag Inc",
            "UF_CRM_1763424498916": ""
        }))
        .expect("company record");
        assert_eq!(untagged.tag, None);
    }
}
