use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};

pub const DEFAULT_MODEL: &str = "flux-schnell";
pub const DEFAULT_EXAMPLE_PROMPT: &str = "a photo of a forest with mist swirling around the tree trunks. The word \"FLUX\" is painted over it in big, red brush strokes with visible texture";

pub const HELM_RELEASE_NAME: &str = "HELM_RELEASE_NAME";
pub const HELM_RELEASE_NAMESPACE: &str = "HELM_RELEASE_NAMESPACE";

/// Splits a comma separated model list, dropping blanks and duplicates.
pub fn parse_models(models: &str) -> Result<Vec<String>> {
    let mut out: Vec<String> = Vec::new();
    for model in models.split(',').map(str::trim).filter(|m| !m.is_empty()) {
        if !out.iter().any(|m| m == model) {
            out.push(model.to_string());
        }
    }
    if out.is_empty() {
        bail!("at least one model is required");
    }
    Ok(out)
}

/// Parses a `name=url` endpoint flag.
pub fn parse_endpoint(s: &str) -> Result<(String, String)> {
    let (name, url) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("expected NAME=URL, got `{s}`"))?;
    let (name, url) = (name.trim(), url.trim());
    if name.is_empty() || url.is_empty() {
        bail!("expected NAME=URL, got `{s}`");
    }
    Ok((name.to_string(), url.to_string()))
}

/// Maps each model to its API server.
///
/// Explicit endpoints win; remaining models fall back to the in-cluster service
/// name derived from the Helm release, when `helm` is `Some((release, namespace))`.
pub fn resolve_endpoints(
    models: &[String],
    explicit: &[(String, String)],
    helm: Option<(&str, &str)>,
) -> Result<HashMap<String, String>> {
    let mut endpoints = HashMap::new();
    for model in models {
        let url = match explicit.iter().find(|(name, _)| name == model) {
            Some((_, url)) => url.clone(),
            None => match helm {
                Some((release, namespace)) => {
                    format!("http://{release}-{model}-api.{namespace}.svc:8000")
                }
                None => bail!(
                    "no endpoint for model `{model}`; pass --endpoint {model}=URL or set \
                     {HELM_RELEASE_NAME} and {HELM_RELEASE_NAMESPACE}"
                ),
            },
        };
        endpoints.insert(model.clone(), url);
    }
    Ok(endpoints)
}

/// Reads the Helm release name and namespace from the environment.
pub fn helm_release_from_env() -> Option<(String, String)> {
    let release = std::env::var(HELM_RELEASE_NAME).ok()?;
    let namespace = std::env::var(HELM_RELEASE_NAMESPACE).ok()?;
    Some((release, namespace))
}
