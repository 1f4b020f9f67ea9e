//! Deterministic names for everything the operator creates outside the CRDs

/// IAM role names are limited to 64 characters
pub const MAX_ROLE_NAME_LEN: usize = 64;

/// Kubernetes object names used here must be valid DNS labels
pub const MAX_OBJECT_NAME_LEN: usize = 63;

const PREFIX: &str = "fis";

/// IAM role created for a template: `fis-<name>`
pub fn role_name(template: &str) -> String {
    truncate(&format!("{}-{}", PREFIX, template), MAX_ROLE_NAME_LEN)
}

/// Inline policy attached to an operator-created role
pub fn role_policy_name(role_name: &str) -> String {
    format!("{}-policy", role_name)
}

/// ServiceAccount, Role and RoleBinding name for a template's namespace access
pub fn access_name(template: &str) -> String {
    truncate(&format!("{}-{}", PREFIX, template), MAX_OBJECT_NAME_LEN)
}

/// Kubernetes username the FIS role is mapped to by its EKS access entry
pub fn access_username(template: &str) -> String {
    access_name(template)
}

/// Role name segment of an IAM role ARN (`arn:aws:iam::123:role/path/name` -> `name`)
pub fn role_name_from_arn(arn: &str) -> Option<&str> {
    let (_, resource) = arn.split_once(":role/")?;
    resource.rsplit('/').next().filter(|n| !n.is_empty())
}

/// Label values are limited to 63 characters
pub const MAX_LABEL_VALUE_LEN: usize = 63;

/// Value of the template label on namespaced objects.
///
/// Template names may run to 253 characters; longer names are cut and the
/// full name goes into an annotation under the same key.
pub fn template_label_value(template: &str) -> String {
    let mut out: String = template.chars().take(MAX_LABEL_VALUE_LEN).collect();
    while out.ends_with(|c: char| !c.is_ascii_alphanumeric()) {
        out.pop();
    }
    out
}

fn truncate(name: &str, max: usize) -> String {
    let mut out: String = name.chars().take(max).collect();
    while out.ends_with('-') {
        out.pop();
    }
    out
}
