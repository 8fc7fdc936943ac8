use crate::analysis::{AnalysisRequest, AnalysisResult, Condition, Urgency};
use crate::server::handlers::{analysis, health, history, session};
use utoipa::OpenApi;
use utoipa::openapi::{Contact, InfoBuilder, License};

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        session::establish,
        session::revoke,
        analysis::analyze,
        history::history,
    ),
    components(schemas(
        health::Health,
        session::SessionRequest,
        session::StatusResponse,
        session::ErrorResponse,
        analysis::AnalysisResponse,
        history::HistoryEntry,
        AnalysisRequest,
        AnalysisResult,
        Condition,
        Urgency,
    )),
    tags(
        (name = "health", description = "Service status"),
        (name = "session", description = "Session cookie management"),
        (name = "analysis", description = "Symptom analysis"),
    )
)]
struct ApiDoc;

/// The HTTP surface, with `info` taken from Cargo metadata.
#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let mut doc = ApiDoc::openapi();
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();
    info.contact = cargo_contact();
    info.license = cargo_license();
    doc.info = info;
    doc
}

fn cargo_contact() -> Option<Contact> {
    // First of the `:` separated Cargo authors, "Name <email>".
    let primary = env!("CARGO_PKG_AUTHORS").split(':').next().map(str::trim)?;
    let (name, email) = match primary.split_once('<') {
        Some((name, email)) => (
            optional_str(name),
            optional_str(email.trim_end_matches('>')),
        ),
        None => (optional_str(primary), None),
    };
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}
