//! Job applications.
//!
//! An applicant applies at most once per job: existing applications are
//! looked up before a new one is written.

use crate::auth::Identity;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::remote::{DocumentPath, Fields, Filter, Query, RemoteStore};
use crate::types::UserId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The job being applied to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    pub id: String,
    pub title: String,
    pub owner_id: UserId,
}

/// What the applicant filled in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationForm {
    pub applicant_name: String,
    /// Phone, email or messenger handle.
    pub contact: String,
    pub message: String,
    pub cv_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplicationOutcome {
    Submitted(String),
    AlreadyApplied,
}

fn non_empty(value: &str) -> Value {
    let value = value.trim();
    if value.is_empty() {
        Value::Null
    } else {
        Value::from(value)
    }
}

/// Submit an application for `job` on behalf of `applicant`.
pub fn submit_application(
    store: &dyn RemoteStore,
    config: &SyncConfig,
    applicant: &Identity,
    job: &JobRef,
    form: &ApplicationForm,
) -> Result<ApplicationOutcome> {
    let me = &applicant.user_id;
    if &job.owner_id == me {
        return Err(SyncError::SelfTarget(me.clone()));
    }
    let name = form.applicant_name.trim();
    if name.is_empty() {
        return Err(SyncError::MissingField("applicant name"));
    }
    let contact = form.contact.trim();
    if contact.is_empty() {
        return Err(SyncError::MissingField("contact"));
    }

    let existing = Query::collection(config.applications_collection.clone())
        .filter(Filter::eq("jobId", job.id.as_str()))
        .filter(Filter::eq("applicantId", me.as_str()))
        .limit(1);
    if !store.get(&existing)?.is_empty() {
        tracing::debug!(job = %job.id, applicant = %me, "already applied");
        return Ok(ApplicationOutcome::AlreadyApplied);
    }

    let id = store.new_document_id(&config.applications_collection);
    let fields = Fields::new()
        .set("jobId", job.id.as_str())
        .set("jobTitle", job.title.as_str())
        .set("ownerId", job.owner_id.as_str())
        .set("applicantId", me.as_str())
        .set("applicantName", name)
        .set("contact", contact)
        .set("message", non_empty(&form.message))
        .set("cvUrl", non_empty(form.cv_url.as_deref().unwrap_or_default()))
        .set("status", "pending")
        .server_timestamp("createdAt");
    store.set(
        &DocumentPath::new(config.applications_collection.clone(), id.clone()),
        fields,
    )?;

    tracing::info!(job = %job.id, applicant = %me, application = %id, "application submitted");
    Ok(ApplicationOutcome::Submitted(id))
}
