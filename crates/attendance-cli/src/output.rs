use attendance_core::{EmployeeSummary, FailureKind, FlowError, IdentityId};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::process::ExitCode;

/// Response written by every command: `{success, message, ...data}`.
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureKind>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
    /// Extra lines for the human rendering.
    #[serde(skip)]
    details: Vec<String>,
    #[serde(skip)]
    internal: bool,
}

impl Envelope {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            reason: None,
            data: Map::new(),
            details: Vec::new(),
            internal: false,
        }
    }

    pub fn failure(reason: FailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason),
            ..Self::success(message)
        }
    }

    /// Setup or I/O failure outside the flows.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            internal: true,
            ..Self::success(message)
        }
    }

    pub fn from_flow(err: &FlowError) -> Self {
        Self {
            internal: !err.is_client_error(),
            ..Self::failure(err.kind(), err.to_string())
        }
    }

    /// The image file could not be read; reported like an undecodable upload.
    pub fn unreadable_image(path: &Path, err: &std::io::Error) -> Self {
        Self::failure(
            FailureKind::InvalidImage,
            format!("cannot read image {}: {err}", path.display()),
        )
    }

    pub fn registered(name: &str, employee_id: IdentityId) -> serde_json::Result<Self> {
        Self::success(format!("employee {name:?} registered as {employee_id}"))
            .with("employee_id", employee_id)
    }

    pub fn marked(
        employee_id: IdentityId,
        name: &str,
        similarity: f32,
        timestamp: &str,
    ) -> serde_json::Result<Self> {
        Ok(Self::success(format!("attendance marked for {name}"))
            .with("employee_name", name)?
            .with("employee_id", employee_id)?
            .with("similarity", similarity)?
            .with("timestamp", timestamp)?
            .detail(format!("similarity {similarity:.3} at {timestamp}")))
    }

    pub fn history(name: &str, timestamps: &[String]) -> serde_json::Result<Self> {
        let records: Vec<Value> = timestamps.iter().map(|t| json!({ "timestamp": t })).collect();
        let mut envelope =
            Self::success(format!("{} attendance records for {name}", timestamps.len()))
                .with("employee_name", name)?
                .with("attendance_count", timestamps.len())?
                .with("records", records)?;
        for stamp in timestamps {
            envelope = envelope.detail(stamp.as_str());
        }
        Ok(envelope)
    }

    pub fn roster(employees: &[EmployeeSummary]) -> serde_json::Result<Self> {
        let mut envelope = Self::success(format!("{} employees enrolled", employees.len()))
            .with("count", employees.len())?
            .with("employees", employees)?;
        for e in employees {
            envelope = envelope.detail(format!("{:>4}  {}", e.id, e.name));
        }
        Ok(envelope)
    }

    pub fn with(mut self, key: &str, value: impl Serialize) -> serde_json::Result<Self> {
        self.data.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(self)
    }

    pub fn detail(mut self, line: impl Into<String>) -> Self {
        self.details.push(line.into());
        self
    }

    /// 0 on success, 1 when the request was denied or invalid, 2 on internal errors.
    pub fn exit_code(&self) -> ExitCode {
        if self.success {
            ExitCode::SUCCESS
        } else if self.internal {
            ExitCode::from(2)
        } else {
            ExitCode::from(1)
        }
    }

    pub fn render(&self, json: bool) -> serde_json::Result<String> {
        if json {
            return serde_json::to_string_pretty(self);
        }
        let mut out = if self.success {
            self.message.clone()
        } else {
            format!("error: {}", self.message)
        };
        for line in &self.details {
            out.push_str("\n  ");
            out.push_str(line);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attendance_core::StorageError;

    #[test]
    fn test_success_flattens_data() {
        let env = Envelope::success("registered")
            .with("employee_id", 7)
            .unwrap();
        let json: Value = serde_json::from_str(&env.render(true).unwrap()).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["message"], "registered");
        assert_eq!(json["employee_id"], 7);
        assert!(json.get("reason").is_none());
        assert_eq!(env.exit_code(), ExitCode::SUCCESS);
    }

    #[test]
    fn test_flow_failure_carries_reason() {
        let env = Envelope::from_flow(&FlowError::LivenessFailure);
        let json: Value = serde_json::from_str(&env.render(true).unwrap()).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["reason"], "liveness_failure");
        assert_eq!(env.exit_code(), ExitCode::from(1));
    }

    #[test]
    fn test_internal_failures_exit_2() {
        let env = Envelope::from_flow(&FlowError::Storage(StorageError::UnknownIdentity(3)));
        assert_eq!(env.exit_code(), ExitCode::from(2));
        assert_eq!(Envelope::error("boom").exit_code(), ExitCode::from(2));
    }

    fn json_of(env: &Envelope) -> Value {
        serde_json::from_str(&env.render(true).unwrap()).unwrap()
    }

    #[test]
    fn test_marked_uses_employee_keys() {
        let env = Envelope::marked(4, "Alice", 0.91, "2024-05-01T09:00:00.000Z").unwrap();
        let json = json_of(&env);
        assert_eq!(json["success"], true);
        assert_eq!(json["employee_name"], "Alice");
        assert_eq!(json["employee_id"], 4);
        assert_eq!(json["timestamp"], "2024-05-01T09:00:00.000Z");
        assert!(json.get("name").is_none());
    }

    #[test]
    fn test_registered_reports_id() {
        let json = json_of(&Envelope::registered("Bob", 9).unwrap());
        assert_eq!(json["success"], true);
        assert_eq!(json["employee_id"], 9);
    }

    #[test]
    fn test_history_shape() {
        let stamps = vec![
            "2024-05-02T09:00:00.000Z".to_string(),
            "2024-05-01T09:00:00.000Z".to_string(),
        ];
        let json = json_of(&Envelope::history("Alice", &stamps).unwrap());
        assert_eq!(json["employee_name"], "Alice");
        assert_eq!(json["attendance_count"], 2);
        assert_eq!(json["records"][0]["timestamp"], "2024-05-02T09:00:00.000Z");
    }

    #[test]
    fn test_roster_shape() {
        let roster = vec![EmployeeSummary {
            id: 1,
            name: "Alice".into(),
        }];
        let json = json_of(&Envelope::roster(&roster).unwrap());
        assert_eq!(json["count"], 1);
        assert_eq!(json["employees"][0]["id"], 1);
        assert_eq!(json["employees"][0]["name"], "Alice");
    }

    #[test]
    fn test_unreadable_image_is_client_error() {
        let err = std::io::Error::from(std::io::ErrorKind::NotFound);
        let env = Envelope::unreadable_image(Path::new("/missing/face.jpg"), &err);
        assert_eq!(env.exit_code(), ExitCode::from(1));
        assert_eq!(json_of(&env)["reason"], "invalid_image");
    }

    #[test]
    fn test_text_rendering() {
        let env = Envelope::success("2 employees")
            .detail("1  Alice")
            .detail("2  Bob");
        assert_eq!(env.render(false).unwrap(), "2 employees\n  1  Alice\n  2  Bob");

        let env = Envelope::failure(FailureKind::NoMatch, "no matching employee");
        assert_eq!(env.render(false).unwrap(), "error: no matching employee");
    }
}
