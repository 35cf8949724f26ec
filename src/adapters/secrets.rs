//! Secret lookup for provider account credentials

use k8s_openapi::api::core::v1::Secret;

use crate::cluster::ClusterStore;
use crate::crd::LocalObjectReference;
use crate::error::{Error, Result};
use crate::remote::ProviderAccount;

/// Key holding the admin portal URL
pub const ADMIN_URL_KEY: &str = "adminURL";

/// Key holding the access token
pub const TOKEN_KEY: &str = "token";

/// Fetch a secret, mapping absence to [`Error::SecretNotFound`]
pub async fn get_secret(
    secrets: &dyn ClusterStore<Secret>,
    name: &str,
    namespace: &str,
) -> Result<Secret> {
    secrets
        .get(namespace, name)
        .await?
        .ok_or_else(|| Error::SecretNotFound(format!("{}/{}", namespace, name)))
}

/// Get a string value from a secret
pub fn get_secret_string(secret: &Secret, key: &str) -> Result<String> {
    let missing = || Error::SecretKeyNotFound {
        secret: secret.metadata.name.clone().unwrap_or_default(),
        key: key.to_string(),
    };

    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .ok_or_else(missing)?;

    String::from_utf8(bytes.0.clone())
        .map_err(|e| Error::Config(format!("Invalid UTF-8 in secret key '{}': {}", key, e)))
}

/// Resolve the provider account of a resource
///
/// Uses the referenced secret, or `default_secret` when the resource names none.
pub async fn provider_account(
    secrets: &dyn ClusterStore<Secret>,
    namespace: &str,
    reference: Option<&LocalObjectReference>,
    default_secret: &str,
) -> Result<ProviderAccount> {
    let name = reference.map(|r| r.name.as_str()).unwrap_or(default_secret);
    let secret = get_secret(secrets, name, namespace).await?;

    Ok(ProviderAccount {
        admin_url: get_secret_string(&secret, ADMIN_URL_KEY)?,
        token: get_secret_string(&secret, TOKEN_KEY)?,
    })
}
