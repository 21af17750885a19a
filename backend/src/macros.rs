//! Shared macros for the backend crate.

/// Generate a `fmt::Debug` implementation that hides credentials.
///
/// Each field is prefixed with how it should be printed:
///
/// - `show field_name` - the value as-is
/// - `redact_option field_name` - `Some("[REDACTED]")` or `None`
///
/// ```ignore
/// redacted_debug!(S3Settings {
///     show bucket,
///     redact_option secret_key,
/// });
/// ```
macro_rules! redacted_debug {
    ($name:ident { $( $kind:ident $field:ident ),* $(,)? }) => {
        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                let mut s = f.debug_struct(stringify!($name));
                $( redacted_debug!(@field s, self, $kind, $field); )*
                s.finish_non_exhaustive()
            }
        }
    };
    (@field $s:ident, $self:ident, show, $field:ident) => {
        $s.field(stringify!($field), &$self.$field);
    };
    (@field $s:ident, $self:ident, redact_option, $field:ident) => {
        $s.field(stringify!($field), &$self.$field.as_ref().map(|_| "[REDACTED]"));
    };
}

#[cfg(test)]
mod tests {
    use crate::config::S3Settings;

    fn settings(secret_key: Option<&str>) -> S3Settings {
        S3Settings {
            bucket: "dumps".to_string(),
            region: "eu-west-1".to_string(),
            endpoint: Some("http://minio:9000".to_string()),
            prefix: None,
            access_key: Some("AKIAEXAMPLE".to_string()),
            secret_key: secret_key.map(str::to_string),
        }
    }

    #[test]
    fn test_secret_key_is_hidden() {
        let output = format!("{:?}", settings(Some("wJalrXUtnFEMI")));
        assert!(output.starts_with("S3Settings {"));
        assert!(output.contains("AKIAEXAMPLE"));
        assert!(output.contains("http://minio:9000"));
        assert!(!output.contains("wJalrXUtnFEMI"));
        assert!(output.contains("secret_key: Some(\"[REDACTED]\")"));
    }

    #[test]
    fn test_missing_secret_key_prints_none() {
        let output = format!("{:?}", settings(None));
        assert!(output.contains("secret_key: None"));
        assert!(output.contains("prefix: None"));
    }
}
