//! The authenticated caller, as handed to the core by the authentication layer.

use std::collections::BTreeSet;

use crate::arn::{ArnError, ArnNormalizer};

/// Shape of an authenticated identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrincipalKind {
    IamRole,
    AssumedRole,
    FederatedUser,
    /// A human user; carries group memberships instead of an ARN.
    User,
}

/// An authenticated caller.
///
/// IAM principals are identified by their ARN in `name`; users by their login
/// name, with access derived from `groups`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub kind: PrincipalKind,
    pub name: String,
    pub groups: BTreeSet<String>,
}

impl Principal {
    /// Build an IAM principal, classifying the ARN by shape.
    ///
    /// # Errors
    ///
    /// Returns the normalizer's error for ARNs that are not role, assumed-role
    /// or federated-user ARNs of the deployment's partition.
    pub fn iam(arn: &str, arns: &ArnNormalizer) -> Result<Self, ArnError> {
        // Validates shape and partition before classifying.
        arns.to_role_arn(arn)?;
        let kind = if arns.is_role_arn(arn) {
            PrincipalKind::IamRole
        } else if arns.is_assumed_role_arn(arn) {
            PrincipalKind::AssumedRole
        } else {
            PrincipalKind::FederatedUser
        };
        Ok(Self {
            kind,
            name: arn.to_owned(),
            groups: BTreeSet::new(),
        })
    }

    pub fn user<I, S>(name: impl Into<String>, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: PrincipalKind::User,
            name: name.into(),
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_iam(&self) -> bool {
        !matches!(self.kind, PrincipalKind::User)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arn::Partition;

    #[test]
    fn classifies_iam_shapes() {
        let arns = ArnNormalizer::new(Partition::Aws);
        let role = Principal::iam("arn:aws:iam::1:role/app", &arns).unwrap();
        assert_eq!(role.kind, PrincipalKind::IamRole);
        let assumed = Principal::iam("arn:aws:sts::1:assumed-role/app/s", &arns).unwrap();
        assert_eq!(assumed.kind, PrincipalKind::AssumedRole);
        let federated = Principal::iam("arn:aws:sts::1:federated-user/app", &arns).unwrap();
        assert_eq!(federated.kind, PrincipalKind::FederatedUser);
        assert!(federated.is_iam());
    }

    #[test]
    fn rejects_groups() {
        let arns = ArnNormalizer::new(Partition::Aws);
        assert!(Principal::iam("arn:aws:iam::1:group/admins", &arns).is_err());
    }

    #[test]
    fn user_collects_groups() {
        let user = Principal::user("alice", ["eng", "ops"]);
        assert!(!user.is_iam());
        assert!(user.groups.contains("eng"));
        assert_eq!(user.groups.len(), 2);
    }
}
