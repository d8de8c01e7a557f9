//! Template Catalog and Placeholder Rendering
//!
//! Templates come from the template source as `{id, body, media_url}` rows.
//! Rendering replaces `[token]` placeholders with record fields in one pass
//! over the body, so values substituted for one token are never rescanned
//! for further tokens.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cr_common::{ContactRecord, Template};
use tracing::warn;

/// Body used when a record references a template that does not exist.
pub const DEFAULT_BODY: &str = "Ciao [nome], ti abbiamo chiamato. Quando possiamo richiamarti?";

/// Template id assumed when a record leaves the template column blank.
pub const DEFAULT_TEMPLATE_ID: &str = "1";

/// Result of resolving a record's template reference.
pub struct ResolvedTemplate {
    pub template: Template,
    /// True when the referenced id was missing and the built-in body was used.
    pub fell_back: bool,
}

/// In-memory catalog built once per cycle from the template source.
pub struct TemplateCatalog {
    templates: Vec<Template>,
}

impl TemplateCatalog {
    pub fn new(templates: Vec<Template>) -> Self {
        Self { templates }
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Resolve a record's template id.
    ///
    /// A blank id means the default template id. An id that matches nothing
    /// resolves to the built-in fallback body with no media, flagged so the
    /// caller can log it.
    pub fn resolve(&self, id: &str) -> ResolvedTemplate {
        let id = id.trim();
        let wanted = if id.is_empty() { DEFAULT_TEMPLATE_ID } else { id };

        match self.templates.iter().find(|t| t.id == wanted) {
            Some(template) => ResolvedTemplate {
                template: template.clone(),
                fell_back: false,
            },
            None => {
                warn!(template_id = wanted, "Template not found, using fallback body");
                ResolvedTemplate {
                    template: Template {
                        id: wanted.to_string(),
                        name: String::new(),
                        body: DEFAULT_BODY.to_string(),
                        media_url: None,
                    },
                    fell_back: true,
                }
            }
        }
    }
}

/// Render a template body against a record.
///
/// Placeholders are bracketed tokens. Unknown tokens pass through verbatim,
/// as do unmatched brackets. `now` is formatted in the store's civil
/// timezone for the `[data]` and `[ora]` tokens.
pub fn render(body: &str, record: &ContactRecord, now: DateTime<Utc>, tz: Tz) -> String {
    let local = now.with_timezone(&tz);
    let mut out = String::with_capacity(body.len());
    let mut rest = body;

    while let Some(open) = rest.find('[') {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        match after_open.find(']') {
            Some(close) => {
                let token = &after_open[..close];
                match lookup(token, record, &local) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('[');
                        out.push_str(token);
                        out.push(']');
                    }
                }
                rest = &after_open[close + 1..];
            }
            None => {
                // Unmatched opening bracket, keep the tail as-is
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn lookup(
    token: &str,
    record: &ContactRecord,
    local: &DateTime<Tz>,
) -> Option<String> {
    match token {
        "nome" => Some(record.name.clone()),
        "cognome" => Some(record.surname.clone()),
        "nome_completo" => Some(record.full_name()),
        "pdv" => Some(record.pos.clone()),
        "operatore" => Some(record.operator.clone()),
        "esito" => Some(record.outcome.clone()),
        "data_chiamata" => Some(record.call_date.clone()),
        "data" => Some(local.format("%d/%m/%Y").to_string()),
        "ora" => Some(local.format("%H:%M").to_string()),
        _ => None,
    }
}
