//! Application-registered data sources.

use tierdb_core::config_string::ConfigString;
use tierdb_core::error::{Error, Result};

use super::{merge_stack, SESSION_CREATE_DEFAULTS};
use crate::format::check_format;

/// Storage for a URI prefix the engine does not own, e.g. `memstore:`.
pub trait DataSource: Send + Sync {
    /// Sources without create support report `ENOTSUP` from `create`.
    fn supports_create(&self) -> bool {
        true
    }

    /// Create an object. `config` already has the session defaults applied.
    fn create(&self, uri: &str, config: &ConfigString) -> Result<()>;
}

/// The data source cannot check formats itself, so that happens here.
pub(super) fn create_data_source(source: &dyn DataSource, uri: &str, config: &str) -> Result<()> {
    if !source.supports_create() {
        return Err(Error::not_supported(format!("{}: unsupported object operation: create", uri)));
    }

    let cfg = merge_stack(&[SESSION_CREATE_DEFAULTS, config])?;
    check_format(&cfg.get_str("key_format").unwrap_or_default())?;
    check_format(&cfg.get_str("value_format").unwrap_or_default())?;

    let user = ConfigString::parse(config)?;
    if matches!(user.get_nonempty("collator").as_deref(), Some(c) if c != "none") {
        return Err(Error::invalid("data source objects do not support collator ordering"));
    }

    source.create(uri, &cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        created: Mutex<Vec<(String, String)>>,
    }

    impl DataSource for Recording {
        fn create(&self, uri: &str, config: &ConfigString) -> Result<()> {
            self.created.lock().push((uri.to_string(), config.to_string()));
            Ok(())
        }
    }

    struct ReadOnlySource;

    impl DataSource for ReadOnlySource {
        fn supports_create(&self) -> bool {
            false
        }

        fn create(&self, _uri: &str, _config: &ConfigString) -> Result<()> {
            unreachable!()
        }
    }

    #[test]
    fn test_defaults_applied() {
        let src = Recording::default();
        create_data_source(&src, "mem:a", "value_format=S").unwrap();
        let created = src.created.lock();
        let cfg = ConfigString::parse(&created[0].1).unwrap();
        assert_eq!(cfg.get_str("key_format").as_deref(), Some("u"));
        assert_eq!(cfg.get_str("value_format").as_deref(), Some("S"));
    }

    #[test]
    fn test_rejections() {
        let src = Recording::default();
        assert!(matches!(
            create_data_source(&src, "mem:a", "key_format=Z"),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            create_data_source(&src, "mem:a", "collator=reverse"),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            create_data_source(&ReadOnlySource, "mem:a", ""),
            Err(Error::NotSupported { .. })
        ));
        assert!(src.created.lock().is_empty());
    }
}
