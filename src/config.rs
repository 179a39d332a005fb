//! Environment-variable configuration for the hosting service: domain,
//! database location, admin/witness identifiers, and policy defaults. No
//! UI/branding/templating fields — this crate has no web front end.
//!
//! Read once at startup (`Settings::from_env`); nothing in the core reads
//! `std::env` directly afterward.

use std::env;

/// Parses a boolean the way the Python `eval(os.environ.get(..., "true"))`
/// idiom does: anything other than a case-insensitive `"false"`/`"0"` is
/// truthy, so an operator typo degrades to the safer default of `true`.
fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(raw) => !matches!(raw.trim().to_ascii_lowercase().as_str(), "false" | "0" | ""),
        Err(_) => default,
    }
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_opt_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Process-wide settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub project_title: String,
    pub admin_api_key: String,
    pub domain: String,
    pub database_url: String,
    pub enable_tails: bool,
    pub max_tails_file_bytes: u64,

    pub webvh_version: String,
    pub webvh_witness: bool,
    pub webvh_watcher: Option<String>,
    pub webvh_prerotation: bool,
    pub webvh_portability: bool,
    pub webvh_endorsement: bool,
    pub webvh_validity: u64,

    pub webvh_witness_id: Option<String>,
    pub webvh_witness_name: Option<String>,
    pub webvh_witness_service_endpoint: Option<String>,
    pub webvh_witness_registry_url: Option<String>,

    pub listen_address: String,
}

impl Settings {
    /// Reads configuration from the process environment, applying defaults
    /// suitable for local development.
    pub fn from_env() -> Self {
        let domain = env_string("WEBVH_DOMAIN", "localhost");

        let database_url = if let Ok(url) = env::var("POSTGRES_URL").filter(|v| !v.is_empty()) {
            url
        } else if let (Ok(user), Ok(password), Ok(host), Ok(port)) = (
            env::var("POSTGRES_USER"),
            env::var("POSTGRES_PASSWORD"),
            env::var("POSTGRES_SERVER_NAME"),
            env::var("POSTGRES_SERVER_PORT"),
        ) {
            format!("postgresql://{user}:{password}@{host}:{port}/didwebvh-registrar")
        } else {
            "sqlite://app.db".to_string()
        };

        Settings {
            project_title: env_string("PROJECT_TITLE", "DID WebVH Registrar"),
            admin_api_key: env_string(
                "WEBVH_ADMIN_API_KEY",
                &env_string("WEBVH_API_KEY", &env_string("API_KEY", "webvh")),
            ),
            domain,
            database_url,
            enable_tails: env_bool("ENABLE_TAILS", true),
            max_tails_file_bytes: env_u64("MAX_TAILS_FILE_BYTES", 10 * 1024 * 1024),

            webvh_version: env_string("WEBVH_VERSION", "1.0"),
            webvh_witness: env_bool("WEBVH_WITNESS", true),
            webvh_watcher: env_opt_string("WEBVH_WATCHER"),
            webvh_prerotation: env_bool("WEBVH_PREROTATION", true),
            webvh_portability: env_bool("WEBVH_PORTABILITY", true),
            webvh_endorsement: env_bool("WEBVH_ENDORSEMENT", true),
            webvh_validity: env_u64("WEBVH_VALIDITY", 0),

            webvh_witness_id: env_opt_string("WEBVH_WITNESS_ID"),
            webvh_witness_name: env_opt_string("WEBVH_WITNESS_NAME"),
            webvh_witness_service_endpoint: env_opt_string("WEBVH_WITNESS_SERVICE_ENDPOINT"),
            webvh_witness_registry_url: env_opt_string("WEBVH_WITNESS_REGISTRY_URL"),

            listen_address: env_string("WEBVH_LISTEN_ADDRESS", "0.0.0.0:8000"),
        }
    }

    pub fn did_web_prefix(&self) -> String {
        format!("did:web:{}", self.domain)
    }

    pub fn did_webvh_prefix(&self) -> String {
        format!("did:webvh:{}", self.webvh_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_bool_defaults_true_on_typo() {
        // SAFETY: test-only, single-threaded env mutation scoped to this test.
        unsafe { env::set_var("TEST_WEBVH_FLAG", "yse") };
        assert!(env_bool("TEST_WEBVH_FLAG", false));
        unsafe { env::remove_var("TEST_WEBVH_FLAG") };
    }

    #[test]
    fn env_bool_recognizes_false() {
        unsafe { env::set_var("TEST_WEBVH_FLAG_2", "false") };
        assert!(!env_bool("TEST_WEBVH_FLAG_2", true));
        unsafe { env::remove_var("TEST_WEBVH_FLAG_2") };
    }

    #[test]
    fn database_url_defaults_to_sqlite() {
        let settings = Settings {
            database_url: "sqlite://app.db".into(),
            ..Settings::from_env()
        };
        assert!(settings.database_url.starts_with("sqlite://") || settings.database_url.starts_with("postgresql://"));
    }
}
