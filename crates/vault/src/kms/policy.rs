//! Master-key access policies and the ownership tag embedded in them.
//!
//! Every key this service creates carries a statement whose `Sid` is
//! `ManagedByVault-<environment>` and whose principal is the service role.
//! Orphan reconciliation treats a key as ours exactly when its policy holds
//! that statement for the running environment and role.

use serde_json::{json, Value};

const OWNERSHIP_SID_PREFIX: &str = "ManagedByVault-";

const SERVICE_ACTIONS: [&str; 7] = [
    "kms:Encrypt",
    "kms:Decrypt",
    "kms:ReEncrypt*",
    "kms:DescribeKey",
    "kms:GetKeyPolicy",
    "kms:ScheduleKeyDeletion",
    "kms:CreateAlias",
];

/// Policy attached to a master key at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPolicy {
    pub environment: String,
    pub service_role_arn: String,
    pub account_root_arn: String,
    /// Principal additionally allowed to decrypt, for principal-scoped keys.
    pub consumer_arn: Option<String>,
}

impl KeyPolicy {
    /// Sid of the ownership statement for `environment`.
    pub fn ownership_sid(environment: &str) -> String {
        format!("{OWNERSHIP_SID_PREFIX}{environment}")
    }

    /// IAM policy document as a JSON string.
    pub fn to_json(&self) -> String {
        let mut statements = vec![
            json!({
                "Sid": "AllowAccountRootAdministration",
                "Effect": "Allow",
                "Principal": { "AWS": self.account_root_arn },
                "Action": "kms:*",
                "Resource": "*",
            }),
            json!({
                "Sid": Self::ownership_sid(&self.environment),
                "Effect": "Allow",
                "Principal": { "AWS": self.service_role_arn },
                "Action": SERVICE_ACTIONS,
                "Resource": "*",
            }),
        ];
        if let Some(consumer) = &self.consumer_arn {
            statements.push(json!({
                "Sid": "AllowConsumerDecrypt",
                "Effect": "Allow",
                "Principal": { "AWS": consumer },
                "Action": "kms:Decrypt",
                "Resource": "*",
            }));
        }
        json!({ "Version": "2012-10-17", "Statement": statements }).to_string()
    }
}

/// Whether `policy_json` marks its key as created by this service for
/// `environment` running as `service_role_arn`.
///
/// Unparseable documents are never considered ours.
pub fn is_managed_by(policy_json: &str, environment: &str, service_role_arn: &str) -> bool {
    let Ok(doc) = serde_json::from_str::<Value>(policy_json) else {
        return false;
    };
    let sid = KeyPolicy::ownership_sid(environment);

    let statements = match doc.get("Statement") {
        Some(Value::Array(list)) => list.iter().collect::<Vec<_>>(),
        Some(single @ Value::Object(_)) => vec![single],
        _ => return false,
    };

    statements.into_iter().any(|stmt| {
        stmt.get("Sid").and_then(Value::as_str) == Some(sid.as_str())
            && principal_matches(stmt.get("Principal"), service_role_arn)
    })
}

fn principal_matches(principal: Option<&Value>, arn: &str) -> bool {
    match principal.and_then(|p| p.get("AWS")) {
        Some(Value::String(s)) => s == arn,
        Some(Value::Array(list)) => list.iter().any(|v| v.as_str() == Some(arn)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROLE: &str = "arn:aws:iam::111111:role/vault";

    fn policy(env: &str) -> KeyPolicy {
        KeyPolicy {
            environment: env.into(),
            service_role_arn: ROLE.into(),
            account_root_arn: "arn:aws:iam::111111:root".into(),
            consumer_arn: None,
        }
    }

    #[test]
    fn generated_policy_is_recognised() {
        assert!(is_managed_by(&policy("prod").to_json(), "prod", ROLE));
    }

    #[test]
    fn other_environment_or_role_not_ours() {
        let doc = policy("dev").to_json();
        assert!(!is_managed_by(&doc, "prod", ROLE));
        assert!(!is_managed_by(&doc, "dev", "arn:aws:iam::111111:role/other"));
    }

    #[test]
    fn consumer_statement_added() {
        let mut p = policy("prod");
        p.consumer_arn = Some("arn:aws:iam::222222:role/app".into());
        let doc: Value = serde_json::from_str(&p.to_json()).unwrap();
        let statements = doc["Statement"].as_array().unwrap();
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[2]["Principal"]["AWS"], "arn:aws:iam::222222:role/app");
    }

    #[test]
    fn principal_list_and_single_statement_forms() {
        let doc = json!({
            "Statement": {
                "Sid": "ManagedByVault-prod",
                "Principal": { "AWS": ["arn:aws:iam::1:role/x", ROLE] },
            }
        })
        .to_string();
        assert!(is_managed_by(&doc, "prod", ROLE));
    }

    #[test]
    fn garbage_is_not_ours() {
        assert!(!is_managed_by("not json", "prod", ROLE));
        assert!(!is_managed_by("{}", "prod", ROLE));
    }
}
