use serde::Deserialize;
use std::collections::HashSet;

/// Status-change notice carried by some deliveries; drives the
/// "genuine transition" gate for registry enrichment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub lead_id: i64,
    pub old_status_id: Option<i64>,
}

/// Everything extracted from one webhook delivery. Never fails to build:
/// an unparsable payload is an empty event, acknowledged upstream as a
/// no-op so the sender does not retry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub lead_ids: Vec<i64>,
    pub status_change: Option<StatusChange>,
}

impl WebhookEvent {
    pub fn is_empty(&self) -> bool {
        self.lead_ids.is_empty()
    }

    pub fn status_change_for(&self, lead_id: i64) -> Option<StatusChange> {
        self.status_change.filter(|change| change.lead_id == lead_id)
    }
}

#[derive(Debug, Default, Deserialize)]
struct JsonPayload {
    #[serde(default)]
    leads: JsonLeads,
}

#[derive(Debug, Default, Deserialize)]
struct JsonLeads {
    #[serde(default)]
    add: Vec<JsonLead>,
    #[serde(default)]
    update: Vec<JsonLead>,
    #[serde(default)]
    status: Vec<JsonStatusLead>,
}

#[derive(Debug, Deserialize)]
struct JsonLead {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct JsonStatusLead {
    id: i64,
    #[serde(default)]
    old_status_id: Option<i64>,
}

/// Detects the payload encoding from the content type and extracts the
/// affected lead ids. AmoCRM mixes JSON, form-encoded and multipart
/// deliveries for the same hook, so every branch is best-effort.
pub fn parse_webhook(content_type: &str, body: &str) -> WebhookEvent {
    if body.trim().is_empty() {
        return WebhookEvent::default();
    }

    if content_type.contains("application/json") {
        return parse_json(body).unwrap_or_default();
    }

    if content_type.contains("application/x-www-form-urlencoded")
        || content_type.contains("multipart/form-data")
    {
        return parse_form(body);
    }

    // Unknown encoding: try JSON anyway, then fall back to bare id runs.
    if let Some(event) = parse_json(body) {
        return event;
    }
    WebhookEvent {
        lead_ids: dedup(scan_digit_runs(body)),
        status_change: None,
    }
}

fn parse_json(body: &str) -> Option<WebhookEvent> {
    let payload: JsonPayload = serde_json::from_str(body).ok()?;
    let mut ids = Vec::new();
    ids.extend(payload.leads.add.iter().map(|lead| lead.id));
    ids.extend(payload.leads.update.iter().map(|lead| lead.id));
    ids.extend(payload.leads.status.iter().map(|lead| lead.id));
    let status_change = payload.leads.status.first().map(|lead| StatusChange {
        lead_id: lead.id,
        old_status_id: lead.old_status_id,
    });
    Some(WebhookEvent {
        lead_ids: dedup(ids),
        status_change,
    })
}

/// Structured query-string parse first; positional scan over the decoded
/// body only when that yields nothing (multipart deliveries carry the same
/// bracketed keys but are not pair-encoded).
fn parse_form(body: &str) -> WebhookEvent {
    let mut sections = FormSections::default();

    for pair in body.split('&') {
        let Some((raw_key, raw_value)) = pair.split_once('=') else {
            continue;
        };
        let key = urlencoding::decode(raw_key).unwrap_or_else(|_| raw_key.into());
        let value = urlencoding::decode(raw_value).unwrap_or_else(|_| raw_value.into());
        let Some((section, field)) = parse_lead_key(&key) else {
            continue;
        };
        let Ok(id) = value.trim().parse::<i64>() else {
            continue;
        };
        sections.record(section, field, id);
    }

    if sections.is_empty() {
        let decoded = urlencoding::decode(body)
            .map(|cow| cow.into_owned())
            .unwrap_or_else(|_| body.to_string());
        for section in ["add", "update", "status"] {
            for id in scan_section_values(&decoded, section, "id") {
                sections.record(section, "id", id);
            }
        }
        for id in scan_section_values(&decoded, "status", "old_status_id") {
            sections.record("status", "old_status_id", id);
        }
    }

    sections.into_event()
}

#[derive(Debug, Default)]
struct FormSections {
    add: Vec<i64>,
    update: Vec<i64>,
    status: Vec<i64>,
    old_status: Vec<i64>,
}

impl FormSections {
    fn record(&mut self, section: &str, field: &str, id: i64) {
        match (section, field) {
            ("add", "id") => self.add.push(id),
            ("update", "id") => self.update.push(id),
            ("status", "id") => self.status.push(id),
            ("status", "old_status_id") => self.old_status.push(id),
            _ => {}
        }
    }

    fn is_empty(&self) -> bool {
        self.add.is_empty() && self.update.is_empty() && self.status.is_empty()
    }

    fn into_event(self) -> WebhookEvent {
        let status_change = self.status.first().map(|id| StatusChange {
            lead_id: *id,
            old_status_id: self.old_status.first().copied(),
        });
        let mut ids = self.add;
        ids.extend(self.update);
        ids.extend(self.status);
        WebhookEvent {
            lead_ids: dedup(ids),
            status_change,
        }
    }
}

/// Splits `leads[<section>][<index>][<field>]` into its section and field.
fn parse_lead_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix("leads[")?;
    let (section, rest) = rest.split_once(']')?;
    let rest = rest.strip_prefix('[')?;
    let (index, rest) = rest.split_once(']')?;
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let field = rest.strip_prefix('[')?.strip_suffix(']')?;
    Some((section, field))
}

/// Positional scan for `leads[<section>][N][<field>]` followed by a digit
/// run, tolerant of whatever separators the encoding put between them.
fn scan_section_values(body: &str, section: &str, field: &str) -> Vec<i64> {
    let mut values = Vec::new();
    let prefix = format!("leads[{section}][");
    let suffix = format!("[{field}]");
    let mut search = body;

    while let Some(pos) = search.find(&prefix) {
        let tail = &search[pos + prefix.len()..];
        search = tail;
        let Some(close) = tail.find(']') else {
            break;
        };
        if close == 0 || !tail[..close].bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let rest = &tail[close + 1..];
        let Some(rest) = rest.strip_prefix(suffix.as_str()) else {
            continue;
        };
        let digits: String = rest
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if let Ok(value) = digits.parse::<i64>() {
            values.push(value);
        }
    }
    values
}

/// Last-ditch extraction: runs of five or more digits, the shortest shape
/// a real lead id takes.
fn scan_digit_runs(body: &str) -> Vec<i64> {
    let mut ids = Vec::new();
    let mut current = String::new();
    for ch in body.chars().chain(std::iter::once(' ')) {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if current.len() >= 5
            && let Ok(id) = current.parse::<i64>()
        {
            ids.push(id);
        }
        current.clear();
    }
    ids
}

fn dedup(ids: Vec<i64>) -> Vec<i64> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_add_and_update_ids() {
        let body = r#"{"leads":{"add":[{"id":100200}],"update":[{"id":100300},{"id":100200}]}}"#;
        let event = parse_webhook("application/json", body);
        assert_eq!(event.lead_ids, vec![100200, 100300]);
        assert!(event.status_change.is_none());
    }

    #[test]
    fn json_status_event_carries_old_status() {
        let body =
            r#"{"leads":{"status":[{"id":100400,"old_status_id":41138689,"status_id":41138695}]}}"#;
        let event = parse_webhook("application/json", body);
        assert_eq!(event.lead_ids, vec![100400]);
        assert_eq!(
            event.status_change,
            Some(StatusChange {
                lead_id: 100400,
                old_status_id: Some(41138689),
            })
        );
    }

    #[test]
    fn form_encoded_structured_parse() {
        let body = "leads%5Bupdate%5D%5B0%5D%5Bid%5D=100500&account%5Bid%5D=321";
        let event = parse_webhook("application/x-www-form-urlencoded", body);
        assert_eq!(event.lead_ids, vec![100500]);
    }

    #[test]
    fn form_encoded_status_with_old_status() {
        let body = "leads%5Bstatus%5D%5B0%5D%5Bid%5D=100600\
                    &leads%5Bstatus%5D%5B0%5D%5Bold_status_id%5D=41138689";
        let event = parse_webhook("application/x-www-form-urlencoded", body);
        assert_eq!(event.lead_ids, vec![100600]);
        assert_eq!(
            event.status_change_for(100600),
            Some(StatusChange {
                lead_id: 100600,
                old_status_id: Some(41138689),
            })
        );
        assert_eq!(event.status_change_for(1), None);
    }

    #[test]
    fn multipart_falls_back_to_positional_scan() {
        let body = "--boundary\r\nContent-Disposition: form-data; name=\"leads[add][0][id]\"\r\n\r\n100700\r\n--boundary--";
        let event = parse_webhook("multipart/form-data; boundary=boundary", body);
        assert_eq!(event.lead_ids, vec![100700]);
    }

    #[test]
    fn unknown_content_type_scans_digit_runs() {
        let event = parse_webhook("text/plain", "lead changed: 100800, again 100800");
        assert_eq!(event.lead_ids, vec![100800]);
    }

    #[test]
    fn garbage_yields_empty_event() {
        let event = parse_webhook("text/plain", "not json");
        assert!(event.is_empty());
        let event = parse_webhook("application/json", "not json");
        assert!(event.is_empty());
        let event = parse_webhook("application/json", "");
        assert!(event.is_empty());
    }

    #[test]
    fn short_digit_runs_are_ignored() {
        let event = parse_webhook("text/plain", "v2 build 1234 ok");
        assert!(event.is_empty());
    }
}
