use crate::error::ConfigError;

/// Parsed, validated, immutable configuration for one block device.
///
/// Built by [`ConfigBuilder`], which accumulates `key=value` pairs in any order
/// (mirroring nbdkit's `config()`/`config_complete()` split) and is consumed once
/// to produce a `Config`.
#[derive(Debug, Clone)]
pub struct Config {
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub session_token: Option<String>,
    pub endpoint_url: Option<String>,
    pub bucket: String,
    /// Single object name (single-object mode) or key prefix (multi-object mode).
    pub key: String,
    /// `Some` iff `size`/`object-size` were both given (multi-object, writable mode).
    pub sizes: Option<DeviceSizes>,
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceSizes {
    pub dev_size: u64,
    pub obj_size: u64,
}

impl Config {
    pub fn is_multi_object(&self) -> bool {
        self.sizes.is_some()
    }

    pub fn num_blocks(&self) -> Option<u64> {
        self.sizes.map(|s| s.dev_size / s.obj_size)
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    access_key: Option<String>,
    secret_key: Option<String>,
    session_token: Option<String>,
    endpoint_url: Option<String>,
    bucket: Option<String>,
    key: Option<String>,
    dev_size: Option<u64>,
    obj_size: Option<u64>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one `key=value` pair, accepting either hyphen or underscore spelling,
    /// the way nbdkit's `S3.config()` does.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "access-key" | "access_key" => self.access_key = Some(value.to_string()),
            "secret-key" | "secret_key" => self.secret_key = Some(value.to_string()),
            "session-token" | "session_token" => self.session_token = Some(value.to_string()),
            "endpoint-url" | "endpoint_url" => self.endpoint_url = Some(value.to_string()),
            "bucket" => self.bucket = Some(value.to_string()),
            "key" => self.key = Some(value.to_string()),
            "size" => self.dev_size = Some(parse_size(value)?),
            "object-size" | "object_size" => self.obj_size = Some(parse_size(value)?),
            other => return Err(ConfigError::UnknownParameter(other.to_string())),
        }
        Ok(())
    }

    pub fn access_key(mut self, v: Option<String>) -> Self {
        self.access_key = v;
        self
    }
    pub fn secret_key(mut self, v: Option<String>) -> Self {
        self.secret_key = v;
        self
    }
    pub fn session_token(mut self, v: Option<String>) -> Self {
        self.session_token = v;
        self
    }
    pub fn endpoint_url(mut self, v: Option<String>) -> Self {
        self.endpoint_url = v;
        self
    }
    pub fn bucket(mut self, v: impl Into<String>) -> Self {
        self.bucket = Some(v.into());
        self
    }
    pub fn key(mut self, v: impl Into<String>) -> Self {
        self.key = Some(v.into());
        self
    }
    pub fn size(mut self, v: Option<u64>) -> Self {
        self.dev_size = v;
        self
    }
    pub fn object_size(mut self, v: Option<u64>) -> Self {
        self.obj_size = v;
        self
    }

    /// Validate once, the way `config_complete()` does, and yield an immutable `Config`.
    pub fn build(self) -> Result<Config, ConfigError> {
        let bucket = self.bucket.ok_or(ConfigError::MissingBucket)?;
        let key = self.key.ok_or(ConfigError::MissingKey)?;

        let sizes = match (self.dev_size, self.obj_size) {
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::SizeWithoutObjectSize),
            (None, Some(_)) => return Err(ConfigError::ObjectSizeWithoutSize),
            (Some(dev_size), Some(obj_size)) => {
                if obj_size == 0 {
                    return Err(ConfigError::ZeroObjectSize);
                }
                if dev_size == 0 || dev_size % obj_size != 0 {
                    return Err(ConfigError::SizeNotMultipleOfObjectSize { size: dev_size, object_size: obj_size });
                }
                Some(DeviceSizes { dev_size, obj_size })
            }
        };

        Ok(Config {
            access_key: self.access_key,
            secret_key: self.secret_key,
            session_token: self.session_token,
            endpoint_url: self.endpoint_url,
            bucket,
            key,
            sizes,
        })
    }
}

/// Parse a human-readable size: a bare byte count, or a count followed by one of
/// `K`/`M`/`G`/`T` (case-insensitive, binary/1024-based), mirroring `nbdkit.parse_size`.
pub fn parse_size(s: &str) -> Result<u64, ConfigError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ConfigError::BadSize(s.to_string()));
    }

    let (digits, mult) = match s.chars().last().unwrap() {
        'k' | 'K' => (&s[..s.len() - 1], 1024u64),
        'm' | 'M' => (&s[..s.len() - 1], 1024 * 1024),
        'g' | 'G' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        't' | 'T' => (&s[..s.len() - 1], 1024 * 1024 * 1024 * 1024),
        _ => (s, 1),
    };

    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|_| ConfigError::BadSize(s.to_string()))?;
    n.checked_mul(mult).ok_or_else(|| ConfigError::BadSize(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_suffixed_sizes() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_size("1M").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("3k").unwrap(), 3 * 1024);
    }

    #[test]
    fn rejects_garbage_sizes() {
        assert!(parse_size("").is_err());
        assert!(parse_size("abc").is_err());
        assert!(parse_size("-1").is_err());
    }

    #[test]
    fn hyphen_and_underscore_spellings_are_equivalent() {
        let mut a = ConfigBuilder::new();
        a.set("access-key", "A").unwrap();
        a.set("bucket", "b").unwrap();
        a.set("key", "k").unwrap();
        let a = a.build().unwrap();

        let mut b = ConfigBuilder::new();
        b.set("access_key", "A").unwrap();
        b.set("bucket", "b").unwrap();
        b.set("key", "k").unwrap();
        let b = b.build().unwrap();

        assert_eq!(a.access_key, b.access_key);
    }

    #[test]
    fn missing_bucket_or_key_is_an_error() {
        assert!(ConfigBuilder::new().key("k").build().is_err());
        assert!(ConfigBuilder::new().bucket("b").build().is_err());
    }

    #[test]
    fn size_and_object_size_must_both_be_present() {
        let err = ConfigBuilder::new()
            .bucket("b")
            .key("k")
            .size(Some(1024))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::SizeWithoutObjectSize));

        let err = ConfigBuilder::new()
            .bucket("b")
            .key("k")
            .object_size(Some(16))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ObjectSizeWithoutSize));
    }

    #[test]
    fn size_must_be_nonzero_multiple_of_object_size() {
        let err = ConfigBuilder::new()
            .bucket("b")
            .key("k")
            .size(Some(100))
            .object_size(Some(16))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::SizeNotMultipleOfObjectSize { .. }));

        let cfg = ConfigBuilder::new()
            .bucket("b")
            .key("k")
            .size(Some(320))
            .object_size(Some(16))
            .build()
            .unwrap();
        assert!(cfg.is_multi_object());
        assert_eq!(cfg.num_blocks(), Some(20));
    }

    #[test]
    fn single_object_mode_when_neither_size_set() {
        let cfg = ConfigBuilder::new().bucket("b").key("k").build().unwrap();
        assert!(!cfg.is_multi_object());
    }
}
