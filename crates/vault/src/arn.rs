//! Parsing and normalization of AWS principal ARNs.
//!
//! Callers arrive as IAM roles, assumed-role sessions or federated users. For
//! permission lookups and key policies every transient form is folded back to
//! the role it came from:
//!
//! ```text
//! arn:aws:sts::222222:assumed-role/path/prince_role/session  ->  arn:aws:iam::222222:role/path/prince_role
//! arn:aws:sts::222222:federated-user/prince_role             ->  arn:aws:iam::222222:role/prince_role
//! ```
//!
//! Every parse is checked against the deployment's partition, so a commercial
//! ARN presented to a China deployment fails before any lookup happens.

use std::{fmt, sync::LazyLock};

use regex::Regex;
use thiserror::Error;

static PRINCIPAL_ARN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^arn:(?P<partition>[a-z-]+):(?P<service>iam|sts)::(?P<account>\d+):(?P<kind>[\w-]+)(?:/(?P<resource>.+))?$",
    )
    .expect("principal ARN pattern is valid")
});

static ASSUMED_ROLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^assumed-role/(?P<role>.+)/(?P<session>[^/]+)$")
        .expect("assumed-role pattern is valid")
});

static FEDERATED_USER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^federated-user/(?P<name>[^/]+)$").expect("federated-user pattern is valid")
});

/// Errors produced while parsing or converting ARNs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArnError {
    /// The input does not look like any supported principal ARN.
    #[error("unrecognized principal ARN: {0}")]
    Unrecognized(String),

    /// The ARN is well formed but belongs to a different partition.
    #[error("ARN {arn} is in partition {found}, this deployment serves {expected}")]
    PartitionMismatch {
        arn: String,
        found: String,
        expected: Partition,
    },

    /// Groups and instance profiles cannot act as principals.
    #[error("ARN {0} names a group or instance profile and cannot be used as a principal")]
    Ineligible(String),

    /// The ARN is a valid principal, but has no role equivalent (users, account roots).
    #[error("ARN {0} cannot be converted to a role ARN")]
    NotConvertible(String),
}

/// AWS partition a deployment runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    Aws,
    AwsCn,
    AwsUsGov,
}

impl Partition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Aws => "aws",
            Partition::AwsCn => "aws-cn",
            Partition::AwsUsGov => "aws-us-gov",
        }
    }

    /// Parse a partition segment as it appears in an ARN.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "aws" => Some(Partition::Aws),
            "aws-cn" => Some(Partition::AwsCn),
            "aws-us-gov" => Some(Partition::AwsUsGov),
            _ => None,
        }
    }

    /// Partition a region name belongs to.
    pub fn from_region(region: &str) -> Self {
        if region.starts_with("cn-") {
            Partition::AwsCn
        } else if region.starts_with("us-gov-") {
            Partition::AwsUsGov
        } else {
            Partition::Aws
        }
    }

    /// Orphan reconciliation only runs in the commercial partition.
    pub fn supports_key_reconciliation(&self) -> bool {
        matches!(self, Partition::Aws)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Components of a principal ARN.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedArn<'a> {
    partition: Partition,
    service: &'a str,
    account: &'a str,
    kind: &'a str,
    resource: Option<&'a str>,
}

/// ARN validator and normalizer bound to one partition.
#[derive(Debug, Clone, Copy)]
pub struct ArnNormalizer {
    partition: Partition,
}

impl ArnNormalizer {
    pub fn new(partition: Partition) -> Self {
        Self { partition }
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    fn parse<'a>(&self, arn: &'a str) -> Result<ParsedArn<'a>, ArnError> {
        let caps = PRINCIPAL_ARN
            .captures(arn)
            .ok_or_else(|| ArnError::Unrecognized(arn.to_owned()))?;

        let (Some(partition), Some(service), Some(account), Some(kind)) = (
            caps.name("partition"),
            caps.name("service"),
            caps.name("account"),
            caps.name("kind"),
        ) else {
            return Err(ArnError::Unrecognized(arn.to_owned()));
        };

        let found = Partition::parse(partition.as_str())
            .ok_or_else(|| ArnError::Unrecognized(arn.to_owned()))?;
        if found != self.partition {
            return Err(ArnError::PartitionMismatch {
                arn: arn.to_owned(),
                found: found.as_str().to_owned(),
                expected: self.partition,
            });
        }

        Ok(ParsedArn {
            partition: found,
            service: service.as_str(),
            account: account.as_str(),
            kind: kind.as_str(),
            resource: caps.name("resource").map(|m| m.as_str()),
        })
    }

    /// Account id embedded in any principal ARN.
    pub fn account_id(&self, arn: &str) -> Result<String, ArnError> {
        Ok(self.parse(arn)?.account.to_owned())
    }

    /// Role name (final path segment) of a role, assumed-role or federated-user ARN.
    pub fn role_name(&self, arn: &str) -> Result<String, ArnError> {
        let role_arn = self.to_role_arn(arn)?;
        let parsed = self.parse(&role_arn)?;
        parsed
            .resource
            .and_then(|r| r.rsplit('/').next())
            .map(str::to_owned)
            .ok_or_else(|| ArnError::Unrecognized(arn.to_owned()))
    }

    pub fn is_role_arn(&self, arn: &str) -> bool {
        matches!(
            self.parse(arn),
            Ok(ParsedArn { service: "iam", kind: "role", resource: Some(_), .. })
        )
    }

    pub fn is_assumed_role_arn(&self, arn: &str) -> bool {
        matches!(
            self.parse(arn),
            Ok(ParsedArn { service: "sts", kind: "assumed-role", resource: Some(_), .. })
        )
    }

    pub fn is_account_root_arn(&self, arn: &str) -> bool {
        matches!(
            self.parse(arn),
            Ok(ParsedArn { service: "iam", kind: "root", resource: None, .. })
        )
    }

    /// Whether `arn` may appear as a principal in a master-key policy.
    ///
    /// Only IAM-namespace roles, users and account roots qualify; STS session
    /// ARNs, groups and instance profiles do not.
    pub fn is_arn_eligible_for_key_policy(&self, arn: &str) -> bool {
        match self.parse(arn) {
            Ok(ParsedArn { service: "iam", kind: "root", resource: None, .. }) => true,
            Ok(ParsedArn {
                service: "iam",
                kind: "role" | "user",
                resource: Some(_),
                ..
            }) => true,
            _ => false,
        }
    }

    /// Canonical role ARN for a role, assumed-role or federated-user ARN.
    ///
    /// Role ARNs are returned unchanged, so the conversion is idempotent.
    pub fn to_role_arn(&self, principal_arn: &str) -> Result<String, ArnError> {
        let parsed = self.parse(principal_arn)?;
        let partition = parsed.partition;
        let account = parsed.account;

        match (parsed.service, parsed.kind) {
            ("iam", "role") if parsed.resource.is_some() => Ok(principal_arn.to_owned()),
            ("iam", "group" | "instance-profile") => {
                Err(ArnError::Ineligible(principal_arn.to_owned()))
            }
            ("sts", "assumed-role") => {
                let rest = strip_arn_prefix(principal_arn, &parsed);
                let caps = ASSUMED_ROLE
                    .captures(rest)
                    .ok_or_else(|| ArnError::Unrecognized(principal_arn.to_owned()))?;
                Ok(format!("arn:{partition}:iam::{account}:role/{}", &caps["role"]))
            }
            ("sts", "federated-user") => {
                let rest = strip_arn_prefix(principal_arn, &parsed);
                let caps = FEDERATED_USER
                    .captures(rest)
                    .ok_or_else(|| ArnError::Unrecognized(principal_arn.to_owned()))?;
                Ok(format!("arn:{partition}:iam::{account}:role/{}", &caps["name"]))
            }
            ("iam", "user" | "root") => Err(ArnError::NotConvertible(principal_arn.to_owned())),
            _ => Err(ArnError::Unrecognized(principal_arn.to_owned())),
        }
    }

    /// Root ARN of the account that owns `arn`.
    pub fn account_root_arn(&self, arn: &str) -> Result<String, ArnError> {
        let parsed = self.parse(arn)?;
        Ok(format!("arn:{}:iam::{}:root", parsed.partition, parsed.account))
    }
}

/// The `kind/resource` tail of an ARN whose prefix has already been parsed.
fn strip_arn_prefix<'a>(arn: &'a str, parsed: &ParsedArn<'_>) -> &'a str {
    let prefix_len = format!(
        "arn:{}:{}::{}:",
        parsed.partition, parsed.service, parsed.account
    )
    .len();
    &arn[prefix_len..]
}
