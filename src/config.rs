use super::error::{DealError, Result};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// eco points granted to each participant when a swap completes
    pub completion_reward: u64,
    /// points granted to the reviewee of a five star review
    pub review_reward: u64,
    /// minimum oracle confidence for an item to count as verified
    pub verification_threshold: u8,
    pub default_page_size: usize,
    pub max_page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            completion_reward: 200,
            review_reward: 100,
            verification_threshold: 85,
            default_page_size: 40,
            max_page_size: 100,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("swap-deals.db"),
        }
    }
}

impl StoreConfig {
    /// Read `SWAP_DB_PATH` from the process environment, loading `.env` first.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        lookup("SWAP_DB_PATH")
            .filter(|path| !path.trim().is_empty())
            .map(|path| Self {
                path: PathBuf::from(path),
            })
            .unwrap_or_default()
    }
}

impl EngineConfig {
    /// Read overrides from the process environment, loading `.env` first.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            completion_reward: parse_or(&lookup, "SWAP_COMPLETION_REWARD", defaults.completion_reward)?,
            review_reward: parse_or(&lookup, "SWAP_REVIEW_REWARD", defaults.review_reward)?,
            verification_threshold: parse_or(
                &lookup,
                "SWAP_VERIFICATION_THRESHOLD",
                defaults.verification_threshold,
            )?,
            default_page_size: parse_or(&lookup, "SWAP_PAGE_SIZE", defaults.default_page_size)?,
            max_page_size: parse_or(&lookup, "SWAP_MAX_PAGE_SIZE", defaults.max_page_size)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_page_size == 0 {
            return Err(DealError::Config("SWAP_MAX_PAGE_SIZE must be at least 1".into()));
        }
        if self.default_page_size == 0 || self.default_page_size > self.max_page_size {
            return Err(DealError::Config(format!(
                "SWAP_PAGE_SIZE must be between 1 and {}",
                self.max_page_size
            )));
        }
        if self.verification_threshold > 100 {
            return Err(DealError::Config(
                "SWAP_VERIFICATION_THRESHOLD must be between 0 and 100".into(),
            ));
        }
        Ok(())
    }

    /// Page size to use for a request, `0` meaning the default.
    pub fn page_size(&self, requested: usize) -> usize {
        match requested {
            0 => self.default_page_size,
            n => n.min(self.max_page_size),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| DealError::Config(format!("{key}={raw:?}: {e}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_the_deployment() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.completion_reward, 200);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("SWAP_COMPLETION_REWARD", "250"),
            ("SWAP_PAGE_SIZE", " 10 "),
        ]))
        .unwrap();
        assert_eq!(config.completion_reward, 250);
        assert_eq!(config.default_page_size, 10);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[("SWAP_REVIEW_REWARD", "lots")])).unwrap_err();
        assert!(matches!(err, DealError::Config(_)));

        let err =
            EngineConfig::from_lookup(lookup(&[("SWAP_VERIFICATION_THRESHOLD", "101")])).unwrap_err();
        assert!(matches!(err, DealError::Config(_)));
    }

    #[test]
    fn page_size_is_clamped() {
        let config = EngineConfig::default();
        assert_eq!(config.page_size(0), 40);
        assert_eq!(config.page_size(7), 7);
        assert_eq!(config.page_size(1_000), 100);
    }

    #[test]
    fn store_path_comes_from_the_lookup() {
        let config = StoreConfig::from_lookup(lookup(&[("SWAP_DB_PATH", "/var/lib/swap/deals.db")]));
        assert_eq!(config.path, PathBuf::from("/var/lib/swap/deals.db"));

        assert_eq!(StoreConfig::from_lookup(lookup(&[])), StoreConfig::default());
        assert_eq!(
            StoreConfig::from_lookup(lookup(&[("SWAP_DB_PATH", "  ")])),
            StoreConfig::default()
        );
    }
}
