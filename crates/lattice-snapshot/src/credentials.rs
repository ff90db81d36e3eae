//! Snapshotter secrets named by class parameters
//!
//! A class names the secret holding driver credentials through two reserved
//! parameters (or their deprecated spellings). Both values are templates that
//! may reference the content and snapshot being processed:
//!
//! | token                                      | namespace | name |
//! |--------------------------------------------|-----------|------|
//! | `${volumesnapshotcontent.name}`            | yes       | yes  |
//! | `${volumesnapshot.namespace}`              | yes       | yes  |
//! | `${volumesnapshot.name}`                   | no        | yes  |
//! | `${volumesnapshot.annotations['KEY']}`     | no        | yes  |

use std::collections::BTreeMap;

use kube::ResourceExt;
use lattice_common::crd::VolumeSnapshot;
use lattice_common::kube_utils::secret_string_data;
use lattice_common::{Error, Result};
use tracing::warn;

use crate::api::SnapshotApi;

/// Reserved prefix of parameters consumed by the controller
pub const CSI_PARAMETER_PREFIX: &str = "csi.storage.k8s.io/";

/// Parameter naming the snapshotter secret
pub const PREFIXED_SECRET_NAME_KEY: &str = "csi.storage.k8s.io/snapshotter-secret-name";
/// Parameter naming the snapshotter secret's namespace
pub const PREFIXED_SECRET_NAMESPACE_KEY: &str = "csi.storage.k8s.io/snapshotter-secret-namespace";

/// Deprecated spelling of [`PREFIXED_SECRET_NAME_KEY`]
pub const SECRET_NAME_KEY: &str = "csiSnapshotterSecretName";
/// Deprecated spelling of [`PREFIXED_SECRET_NAMESPACE_KEY`]
pub const SECRET_NAMESPACE_KEY: &str = "csiSnapshotterSecretNamespace";

const TOKEN_CONTENT_NAME: &str = "volumesnapshotcontent.name";
const TOKEN_SNAPSHOT_NAMESPACE: &str = "volumesnapshot.namespace";
const TOKEN_SNAPSHOT_NAME: &str = "volumesnapshot.name";

/// Location of a snapshotter secret
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretRef {
    /// Secret name
    pub name: String,
    /// Secret namespace
    pub namespace: String,
}

/// Name and namespace templates as written in the class parameters
#[derive(Debug, PartialEq, Eq)]
struct SecretTemplates {
    name: String,
    namespace: String,
}

fn verify_and_get_secret_templates(
    parameters: &BTreeMap<String, String>,
) -> Result<Option<SecretTemplates>> {
    let deprecated_name = parameters.get(SECRET_NAME_KEY);
    let deprecated_namespace = parameters.get(SECRET_NAMESPACE_KEY);
    let prefixed_name = parameters.get(PREFIXED_SECRET_NAME_KEY);
    let prefixed_namespace = parameters.get(PREFIXED_SECRET_NAMESPACE_KEY);

    if deprecated_name.is_some() {
        warn!(
            "\"{}\" is deprecated and will be removed in a future release, use \"{}\" instead",
            SECRET_NAME_KEY, PREFIXED_SECRET_NAME_KEY
        );
    }
    if deprecated_namespace.is_some() {
        warn!(
            "\"{}\" is deprecated and will be removed in a future release, use \"{}\" instead",
            SECRET_NAMESPACE_KEY, PREFIXED_SECRET_NAMESPACE_KEY
        );
    }

    let any_deprecated = deprecated_name.is_some() || deprecated_namespace.is_some();
    let any_prefixed = prefixed_name.is_some() || prefixed_namespace.is_some();
    if any_deprecated && any_prefixed {
        return Err(Error::validation(
            "Snapshotter secrets specified in paramaters with both \"csi\" and \"csi.storage.k8s.io/\" keys",
        ));
    }

    let (name, namespace) = if any_prefixed {
        (prefixed_name, prefixed_namespace)
    } else {
        (deprecated_name, deprecated_namespace)
    };

    match (name, namespace) {
        (None, None) => Ok(None),
        (Some(name), Some(namespace)) => {
            if name.is_empty() || namespace.is_empty() {
                return Err(Error::validation(
                    "Snapshotter secrets specified in parameters but value of either namespace or name is empty",
                ));
            }
            Ok(Some(SecretTemplates {
                name: name.clone(),
                namespace: namespace.clone(),
            }))
        }
        _ => Err(Error::validation(
            "either name and namespace for Snapshotter secrets specified, Both must be specified",
        )),
    }
}

/// Expand every `${token}` in `template` from `values`
///
/// Tokens without a value are collected and reported together.
fn resolve_template(template: &str, values: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut missing = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let token = &after[..end];
                match values.get(token) {
                    Some(value) => out.push_str(value),
                    None => missing.push(token.to_string()),
                }
                rest = &after[end + 1..];
            }
            None => {
                // unterminated: keep literally
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);

    if !missing.is_empty() {
        return Err(Error::validation(format!("invalid tokens: {:?}", missing)));
    }
    Ok(out)
}

fn is_dns1123_label(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 63
        && value
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !value.starts_with('-')
        && !value.ends_with('-')
}

fn is_dns1123_subdomain(value: &str) -> bool {
    !value.is_empty() && value.len() <= 253 && value.split('.').all(is_dns1123_label)
}

/// Resolve the snapshotter secret named by `parameters`
///
/// `snapshot` is absent on delete, in which case only the content-name token
/// resolves. Returns `Ok(None)` when the class names no secret.
pub fn get_secret_reference(
    parameters: &BTreeMap<String, String>,
    content_name: &str,
    snapshot: Option<&VolumeSnapshot>,
) -> Result<Option<SecretRef>> {
    let Some(templates) = verify_and_get_secret_templates(parameters)? else {
        return Ok(None);
    };

    let mut namespace_values = BTreeMap::new();
    namespace_values.insert(TOKEN_CONTENT_NAME.to_string(), content_name.to_string());
    if let Some(snap) = snapshot {
        namespace_values.insert(
            TOKEN_SNAPSHOT_NAMESPACE.to_string(),
            snap.namespace().unwrap_or_default(),
        );
    }
    let namespace = resolve_template(&templates.namespace, &namespace_values).map_err(|e| {
        Error::validation(format!(
            "error resolving value {:?}: {}",
            templates.namespace, e
        ))
    })?;
    if !is_dns1123_label(&namespace) {
        if namespace == templates.namespace {
            return Err(Error::validation(format!(
                "{:?} is not a valid namespace name",
                templates.namespace
            )));
        }
        return Err(Error::validation(format!(
            "{:?} resolved to {:?} which is not a valid namespace name",
            templates.namespace, namespace
        )));
    }

    let mut name_values = namespace_values;
    if let Some(snap) = snapshot {
        name_values.insert(TOKEN_SNAPSHOT_NAME.to_string(), snap.name_any());
        for (key, value) in snap.annotations() {
            name_values.insert(
                format!("volumesnapshot.annotations['{}']", key),
                value.clone(),
            );
        }
    }
    let name = resolve_template(&templates.name, &name_values).map_err(|e| {
        Error::validation(format!("error resolving value {:?}: {}", templates.name, e))
    })?;
    if !is_dns1123_subdomain(&name) {
        if name == templates.name {
            return Err(Error::validation(format!(
                "{:?} is not a valid secret name",
                templates.name
            )));
        }
        return Err(Error::validation(format!(
            "{:?} resolved to {:?} which is not a valid secret name",
            templates.name, name
        )));
    }

    Ok(Some(SecretRef { name, namespace }))
}

/// Fetch the credentials held by `secret_ref`; no reference means no credentials
pub async fn get_credentials(
    api: &dyn SnapshotApi,
    secret_ref: Option<&SecretRef>,
) -> Result<BTreeMap<String, String>> {
    let Some(secret_ref) = secret_ref else {
        return Ok(BTreeMap::new());
    };
    let secret = api
        .get_secret(&secret_ref.namespace, &secret_ref.name)
        .await
        .map_err(|e| {
            Error::validation(format!(
                "error getting secret {} in namespace {}: {}",
                secret_ref.name, secret_ref.namespace, e
            ))
        })?
        .ok_or_else(|| {
            Error::validation(format!(
                "error getting secret {} in namespace {}: not found",
                secret_ref.name, secret_ref.namespace
            ))
        })?;
    secret_string_data(&secret)
}

/// Drop the parameters the controller consumed before handing the rest to the driver
///
/// A reserved-prefix key other than the secret keys is an error.
pub fn remove_prefixed_parameters(
    parameters: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for (key, value) in parameters {
        if key.starts_with(CSI_PARAMETER_PREFIX) {
            if key == PREFIXED_SECRET_NAME_KEY || key == PREFIXED_SECRET_NAMESPACE_KEY {
                continue;
            }
            return Err(Error::validation(format!(
                "found unknown parameter key {:?} with reserved namespace {}",
                key, CSI_PARAMETER_PREFIX
            )));
        }
        out.insert(key.clone(), value.clone());
    }
    Ok(out)
}
