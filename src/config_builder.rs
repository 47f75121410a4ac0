//! Builds the Xray config from the stored template and the enabled inbounds

use crate::error::{XrayError, XrayResult};
use crate::store::{InboundStore, SettingStore};
use crate::xray_config::XrayConfig;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default lifetime of a built config
pub const DEFAULT_CONFIG_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

type CachedConfig = Option<(Instant, Arc<XrayConfig>)>;

/// Merges the template with the enabled inbounds, caching the result for a TTL
pub struct ConfigBuilder {
    settings: Arc<dyn SettingStore>,
    inbounds: Arc<dyn InboundStore>,
    ttl: Duration,
    cache: RwLock<CachedConfig>,
}

impl ConfigBuilder {
    pub fn new(
        settings: Arc<dyn SettingStore>,
        inbounds: Arc<dyn InboundStore>,
        ttl: Duration,
    ) -> Self {
        Self {
            settings,
            inbounds,
            ttl,
            cache: RwLock::new(None),
        }
    }

    pub fn inbound_store(&self) -> &Arc<dyn InboundStore> {
        &self.inbounds
    }

    fn fresh(&self, cache: &CachedConfig) -> Option<Arc<XrayConfig>> {
        match cache {
            Some((built_at, config)) if built_at.elapsed() < self.ttl => Some(Arc::clone(config)),
            _ => None,
        }
    }

    /// The current config, rebuilt only when the cached one is stale
    pub fn build(&self) -> XrayResult<Arc<XrayConfig>> {
        if let Some(config) = self.fresh(&self.cache.read()) {
            return Ok(config);
        }

        let mut cache = self.cache.write();
        // Another caller may have rebuilt while we waited for the write lock
        if let Some(config) = self.fresh(&cache) {
            return Ok(config);
        }

        let template = self
            .settings
            .xray_config_template()
            .map_err(XrayError::Store)?;
        let mut config = XrayConfig::from_json(&template).map_err(XrayError::Template)?;

        let inbounds = self.inbounds.enabled_inbounds().map_err(XrayError::Store)?;
        for inbound in inbounds.iter().filter(|inbound| inbound.enable) {
            config.inbounds.push(inbound.xray_inbound_config());
        }

        debug!(inbounds = config.inbounds.len(), "Built xray config");
        let config = Arc::new(config);
        *cache = Some((Instant::now(), Arc::clone(&config)));
        Ok(config)
    }

    pub fn invalidate(&self) {
        *self.cache.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Inbound;
    use crate::traffic::Traffic;
    use crate::xray_config::InboundConfig;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSettings {
        template: Mutex<String>,
        reads: AtomicUsize,
    }

    impl SettingStore for FakeSettings {
        fn xray_config_template(&self) -> anyhow::Result<String> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.template.lock().clone())
        }
    }

    struct FakeInbounds {
        inbounds: Mutex<Vec<Inbound>>,
    }

    impl InboundStore for FakeInbounds {
        fn all_inbounds(&self) -> anyhow::Result<Vec<Inbound>> {
            Ok(self.inbounds.lock().clone())
        }

        fn add_traffic(&self, _traffics: &[Traffic]) -> anyhow::Result<()> {
            Ok(())
        }

        fn disable_invalid_inbounds(&self) -> anyhow::Result<usize> {
            Ok(0)
        }

        fn disable_exhausted_inbounds(&self) -> anyhow::Result<usize> {
            Ok(0)
        }
    }

    fn entry(tag: &str, port: u16, enable: bool) -> Inbound {
        Inbound {
            enable,
            port,
            tag: tag.to_string(),
            ..Default::default()
        }
    }

    fn builder(
        template: &str,
        inbounds: Vec<Inbound>,
        ttl: Duration,
    ) -> (ConfigBuilder, Arc<FakeSettings>, Arc<FakeInbounds>) {
        let settings = Arc::new(FakeSettings {
            template: Mutex::new(template.to_string()),
            reads: AtomicUsize::new(0),
        });
        let store = Arc::new(FakeInbounds {
            inbounds: Mutex::new(inbounds),
        });
        let builder = ConfigBuilder::new(settings.clone(), store.clone(), ttl);
        (builder, settings, store)
    }

    #[test]
    fn test_merges_enabled_entries_into_template() {
        let (builder, _, _) = builder(
            r#"{"inbounds": []}"#,
            vec![entry("proxy1", 1080, true), entry("off", 2080, false)],
            DEFAULT_CONFIG_CACHE_TTL,
        );

        let config = builder.build().unwrap();
        assert_eq!(config.inbounds, vec![InboundConfig::new("proxy1", 1080)]);
        assert_eq!(
            serde_json::to_value(config.as_ref()).unwrap(),
            serde_json::json!({"inbounds": [{"tag": "proxy1", "port": 1080}]})
        );
    }

    #[test]
    fn test_template_inbounds_come_first() {
        let (builder, _, _) = builder(
            r#"{"inbounds": [{"tag": "api", "port": 62789, "protocol": "dokodemo-door"}], "stats": {}}"#,
            vec![entry("proxy1", 1080, true)],
            DEFAULT_CONFIG_CACHE_TTL,
        );

        let config = builder.build().unwrap();
        let tags: Vec<&str> = config.inbounds.iter().map(|i| i.tag.as_str()).collect();
        assert_eq!(tags, vec!["api", "proxy1"]);
        assert!(config.sections.contains_key("stats"));
    }

    #[test]
    fn test_second_build_within_ttl_is_cached() {
        let (builder, settings, store) = builder(
            r#"{"inbounds": []}"#,
            vec![entry("proxy1", 1080, true)],
            DEFAULT_CONFIG_CACHE_TTL,
        );

        let first = builder.build().unwrap();
        store.inbounds.lock().push(entry("proxy2", 2080, true));
        let second = builder.build().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(settings.reads.load(Ordering::SeqCst), 1);

        builder.invalidate();
        let third = builder.build().unwrap();
        assert_eq!(third.inbounds.len(), 2);
        assert_eq!(settings.reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_expired_cache_is_rebuilt() {
        let (builder, settings, _) = builder(
            r#"{"inbounds": []}"#,
            Vec::new(),
            Duration::from_millis(10),
        );

        builder.build().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        builder.build().unwrap();
        assert_eq!(settings.reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_invalid_template_is_typed_error() {
        let (builder, settings, _) = builder("not json", Vec::new(), DEFAULT_CONFIG_CACHE_TTL);

        assert!(matches!(builder.build(), Err(XrayError::Template(_))));

        *settings.template.lock() = r#"{"inbounds": []}"#.to_string();
        // Failures are not cached
        assert!(builder.build().is_ok());
    }
}
