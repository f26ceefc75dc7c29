use std::collections::HashMap;

use jobhub_engine::{JobInstance, JobRecord, JobStatus, RawArgs};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::ApiError;

pub fn parse_positive_usize(
    raw: Option<&String>,
    fallback: usize,
    field: &str,
) -> Result<usize, ApiError> {
    match raw {
        Some(value) => {
            let parsed = value.parse::<usize>().map_err(|_| {
                ApiError::bad_request(format!("{field} must be a positive integer"))
            })?;
            if parsed == 0 {
                return Err(ApiError::bad_request(format!("{field} must be at least 1")));
            }
            Ok(parsed)
        }
        None => Ok(fallback),
    }
}

/// Extract the `jobId` path parameter. Malformed ids cannot name a job.
pub fn job_id_param(path: &HashMap<String, String>) -> Result<Uuid, ApiError> {
    let raw = path
        .get("jobId")
        .ok_or_else(|| ApiError::bad_request("missing jobId path parameter"))?;
    Uuid::parse_str(raw).map_err(|_| ApiError::not_found(format!("job not found: {raw}")))
}

pub fn parse_status(raw: Option<&String>) -> Result<Option<JobStatus>, ApiError> {
    raw.filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.parse::<JobStatus>()
                .map_err(|_| ApiError::bad_request(format!("unknown status `{s}`")))
        })
        .transpose()
}

/// Arguments as posted by a client; a missing field means no arguments.
pub fn raw_args(body: Option<&Value>) -> Result<RawArgs, ApiError> {
    Ok(RawArgs::from_json(body.cloned().unwrap_or(Value::Null))?)
}

pub fn job_to_payload(job: &JobRecord) -> Value {
    json!({
        "id": job.id,
        "jobType": job.job_name,
        "status": job.status.as_str(),
        "createdAt": job.created_at.to_rfc3339(),
        "updatedAt": job.updated_at.to_rfc3339(),
    })
}

/// Instances carry their arguments as the codec's string; they are echoed
/// back as JSON when they parse as such.
pub fn instance_to_payload(instance: &JobInstance) -> Value {
    let args = serde_json::from_str::<Value>(&instance.args)
        .unwrap_or_else(|_| Value::String(instance.args.clone()));
    json!({
        "id": instance.id,
        "jobId": instance.job_id,
        "jobType": instance.job_name,
        "args": args,
        "status": instance.status.as_str(),
        "progress": instance.progress,
        "progressText": instance.progress_text,
        "log": instance.log,
        "scheduledAt": instance.scheduled_at.map(|dt| dt.to_rfc3339()),
        "createdAt": instance.created_at.to_rfc3339(),
        "updatedAt": instance.updated_at.to_rfc3339(),
        "startedAt": instance.started_at.map(|dt| dt.to_rfc3339()),
        "finishedAt": instance.finished_at.map(|dt| dt.to_rfc3339()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_parameters_must_be_positive() {
        assert_eq!(parse_positive_usize(None, 20, "perPage").unwrap(), 20);
        assert_eq!(
            parse_positive_usize(Some(&"3".to_string()), 20, "page").unwrap(),
            3
        );
        assert!(parse_positive_usize(Some(&"0".to_string()), 20, "page").is_err());
        assert!(parse_positive_usize(Some(&"x".to_string()), 20, "page").is_err());
    }

    #[test]
    fn status_filter_uses_literal_names() {
        assert_eq!(
            parse_status(Some(&"Running".to_string())).unwrap(),
            Some(JobStatus::Running)
        );
        assert_eq!(parse_status(Some(&String::new())).unwrap(), None);
        assert!(parse_status(Some(&"running".to_string())).is_err());
    }

    #[test]
    fn malformed_job_id_is_not_found() {
        let mut path = HashMap::new();
        path.insert("jobId".to_string(), "nope".to_string());
        assert!(matches!(job_id_param(&path), Err(ApiError::NotFound(_))));
    }

    #[test]
    fn instance_args_are_echoed_as_json() {
        let instance = JobInstance::new(Uuid::new_v4(), "SendEmail", r#"{"to":"a@b.com"}"#);
        let payload = instance_to_payload(&instance);
        assert_eq!(payload["args"]["to"], "a@b.com");
        assert_eq!(payload["status"], "New");
    }
}
