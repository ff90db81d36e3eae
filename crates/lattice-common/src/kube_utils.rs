//! Helpers over object metadata and secrets
//!
//! Shared by the persistence layer and the reconcilers.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::Error;

/// Decode every key of a secret into a UTF-8 string map
///
/// Both `data` and `stringData` are honoured; `stringData` wins on overlap
/// the same way the API server merges them.
pub fn secret_string_data(secret: &Secret) -> Result<BTreeMap<String, String>, Error> {
    let name = secret.metadata.name.as_deref().unwrap_or_default();
    let mut out = BTreeMap::new();
    for (key, value) in secret.data.iter().flatten() {
        let decoded = String::from_utf8(value.0.clone()).map_err(|_| {
            Error::serialization_for_kind("Secret", format!("{}: key {} is not UTF-8", name, key))
        })?;
        out.insert(key.clone(), decoded);
    }
    for (key, value) in secret.string_data.iter().flatten() {
        out.insert(key.clone(), value.clone());
    }
    Ok(out)
}

/// Parse a resourceVersion as the numeric counter it is in practice
///
/// Kubernetes treats resourceVersion as opaque; etcd-backed servers emit
/// integers. An unparseable or missing version yields `None`.
pub fn resource_version(meta: &ObjectMeta) -> Option<u64> {
    meta.resource_version.as_deref()?.parse().ok()
}

/// Whether the object carries the given finalizer
pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Add a finalizer; returns false if it was already present
pub fn add_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    if has_finalizer(meta, finalizer) {
        return false;
    }
    meta.finalizers
        .get_or_insert_with(Vec::new)
        .push(finalizer.to_string());
    true
}

/// Remove a finalizer; returns false if it was not present
pub fn remove_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    let Some(finalizers) = meta.finalizers.as_mut() else {
        return false;
    };
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    finalizers.len() != before
}

/// Whether the object has been marked for deletion
pub fn is_being_deleted(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}
