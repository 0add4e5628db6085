use crate::models::ServerDefinition;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVariable {
    pub key: String,
    pub default_value: String,
    pub stored_value: Option<String>,
}

impl EnvVariable {
    /// Stored secret first, then the manifest default.
    pub fn prefilled(&self) -> &str {
        self.stored_value.as_deref().unwrap_or(&self.default_value)
    }
}

/// The environment variables a server declares, offered to the user before enabling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvPrompt {
    pub server: String,
    pub variables: Vec<EnvVariable>,
}

impl EnvPrompt {
    pub fn new(definition: &ServerDefinition, stored: Option<&BTreeMap<String, String>>) -> Self {
        let variables = definition
            .env
            .iter()
            .map(|(key, default_value)| EnvVariable {
                key: key.clone(),
                default_value: default_value.clone(),
                stored_value: stored.and_then(|values| values.get(key)).cloned(),
            })
            .collect();
        Self {
            server: definition.name.clone(),
            variables,
        }
    }

    pub fn prefilled(&self) -> BTreeMap<String, String> {
        self.variables
            .iter()
            .map(|item| (item.key.clone(), item.prefilled().to_string()))
            .collect()
    }

    /// Keeps only declared keys; anything the resolver left out stays prefilled.
    pub fn complete(&self, mut answers: BTreeMap<String, String>) -> BTreeMap<String, String> {
        self.variables
            .iter()
            .map(|item| {
                let value = answers
                    .remove(&item.key)
                    .unwrap_or_else(|| item.prefilled().to_string());
                (item.key.clone(), value)
            })
            .collect()
    }
}

/// Supplies values for declared environment variables. Returning `None`
/// cancels the enable operation before anything is written.
pub trait EnvResolver {
    fn resolve(&mut self, prompt: &EnvPrompt) -> Option<BTreeMap<String, String>>;
}

impl<F> EnvResolver for F
where
    F: FnMut(&EnvPrompt) -> Option<BTreeMap<String, String>>,
{
    fn resolve(&mut self, prompt: &EnvPrompt) -> Option<BTreeMap<String, String>> {
        self(prompt)
    }
}

/// Accepts the prefilled values without asking.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultsResolver;

impl EnvResolver for DefaultsResolver {
    fn resolve(&mut self, prompt: &EnvPrompt) -> Option<BTreeMap<String, String>> {
        Some(prompt.prefilled())
    }
}

/// Env map to store in a host entry when its definition is rewritten.
///
/// The host's current values are kept as-is while the declared key set is
/// unchanged. Otherwise declared keys keep their host value where present and
/// fall back to the stored secret, then the manifest default.
pub fn carry_over_env(
    definition: &ServerDefinition,
    host_env: &BTreeMap<String, String>,
    stored: Option<&BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    if host_env.keys().eq(definition.env.keys()) {
        return host_env.clone();
    }
    definition
        .env
        .iter()
        .map(|(key, default_value)| {
            let value = host_env
                .get(key)
                .or_else(|| stored.and_then(|values| values.get(key)))
                .unwrap_or(default_value);
            (key.clone(), value.clone())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{carry_over_env, DefaultsResolver, EnvPrompt, EnvResolver};
    use crate::models::ServerDefinition;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn pizza(env: &[(&str, &str)]) -> ServerDefinition {
        ServerDefinition {
            name: String::from("Pizza"),
            command: String::from("python"),
            args: Vec::new(),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            source_path: PathBuf::from("/srv/Pizza"),
            extra: Default::default(),
        }
    }

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn stored_secret_takes_precedence_over_default() {
        let definition = pizza(&[("API_KEY", "changeme"), ("REGION", "us")]);
        let stored = map(&[("API_KEY", "s3cret")]);
        let prompt = EnvPrompt::new(&definition, Some(&stored));
        assert_eq!(
            DefaultsResolver.resolve(&prompt),
            Some(map(&[("API_KEY", "s3cret"), ("REGION", "us")]))
        );
    }

    #[test]
    fn complete_drops_undeclared_and_fills_missing() {
        let definition = pizza(&[("API_KEY", "changeme"), ("REGION", "us")]);
        let prompt = EnvPrompt::new(&definition, None);
        let completed = prompt.complete(map(&[("API_KEY", "typed"), ("EXTRA", "x")]));
        assert_eq!(completed, map(&[("API_KEY", "typed"), ("REGION", "us")]));
    }

    #[test]
    fn closures_can_cancel() {
        let definition = pizza(&[("API_KEY", "")]);
        let prompt = EnvPrompt::new(&definition, None);
        let mut cancel = |_: &EnvPrompt| -> Option<BTreeMap<String, String>> { None };
        assert_eq!(cancel.resolve(&prompt), None);
    }

    #[test]
    fn carry_over_keeps_host_values_when_keys_unchanged() {
        let definition = pizza(&[("API_KEY", "")]);
        let host = map(&[("API_KEY", "from-host")]);
        let stored = map(&[("API_KEY", "from-store")]);
        assert_eq!(carry_over_env(&definition, &host, Some(&stored)), host);
    }

    #[test]
    fn carry_over_follows_declared_keys_when_they_change() {
        let definition = pizza(&[("API_KEY", ""), ("REGION", "us")]);
        let host = map(&[("API_KEY", "from-host"), ("OLD", "gone")]);
        assert_eq!(
            carry_over_env(&definition, &host, None),
            map(&[("API_KEY", "from-host"), ("REGION", "us")])
        );
    }
}
