use std::{env, fs, net::SocketAddr, path::Path, path::PathBuf, time::Duration};

use crate::{errors::Error, Result};

/// Typed process configuration, read from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    pub carrier: CarrierSettings,
    pub dispatch: DispatchSettings,
    pub correlator: CorrelatorSettings,
    pub runtime: RuntimeSettings,

    // Account-wide carrier cap (applied across every running campaign)
    pub account_min_send_interval: Duration,

    // Storage / HTTP
    pub database_path: PathBuf,
    pub listen_addr: SocketAddr,
}

/// Carrier credentials and endpoints.
#[derive(Clone, Debug)]
pub struct CarrierSettings {
    pub api_key: String,
    pub api_secret: String,
    pub base_url: String,
    pub country: String,
    pub timeout: Duration,
    /// Delivery-receipt URL attached to every outbound message.
    pub status_callback_url: String,
}

#[derive(Clone, Debug)]
pub struct DispatchSettings {
    /// Inbound-reply URL registered for each campaign's sender number.
    pub reply_callback_url: String,
}

#[derive(Clone, Debug)]
pub struct CorrelatorSettings {
    pub stop_keyword: String,
}

impl Default for CorrelatorSettings {
    fn default() -> Self {
        Self {
            stop_keyword: "stop".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RuntimeSettings {
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the process environment in `load`).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let require = |key: &str| {
            get(key).ok_or_else(|| {
                Error::Config(format!("{key} environment variable is required"))
            })
        };
        let get_u64 = |key: &str| -> Result<Option<u64>> {
            get(key)
                .map(|v| {
                    v.parse::<u64>()
                        .map_err(|_| Error::Config(format!("{key} must be an integer (got {v})")))
                })
                .transpose()
        };

        let carrier = CarrierSettings {
            api_key: require("VONAGE_API_KEY")?,
            api_secret: require("VONAGE_API_SECRET")?,
            base_url: get("VONAGE_BASE_URL")
                .unwrap_or_else(|| "https://rest.nexmo.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            country: get("CARRIER_COUNTRY").unwrap_or_else(|| "US".to_string()),
            timeout: Duration::from_millis(get_u64("CARRIER_TIMEOUT_MS")?.unwrap_or(10_000)),
            status_callback_url: require("MESSAGE_STATUS_URL")?,
        };

        let dispatch = DispatchSettings {
            reply_callback_url: require("MESSAGE_REPLY_URL")?,
        };

        let correlator = CorrelatorSettings {
            stop_keyword: get("STOP_KEYWORD")
                .map(|k| k.to_lowercase())
                .unwrap_or_else(|| CorrelatorSettings::default().stop_keyword),
        };

        let max_attempts = get_u64("TASK_MAX_ATTEMPTS")?.unwrap_or(3);
        let max_attempts = u32::try_from(max_attempts)
            .ok()
            .filter(|n| *n >= 1)
            .ok_or_else(|| {
                Error::Config(format!(
                    "TASK_MAX_ATTEMPTS must be between 1 and {} (got {max_attempts})",
                    u32::MAX
                ))
            })?;
        let runtime = RuntimeSettings {
            max_attempts,
            retry_backoff: Duration::from_millis(get_u64("TASK_RETRY_BACKOFF_MS")?.unwrap_or(5_000)),
        };

        // Vonage caps an account at 30 messages/sec.
        let account_min_send_interval =
            Duration::from_millis(get_u64("ACCOUNT_MIN_SEND_INTERVAL_MS")?.unwrap_or(34));

        // Contacts and opt-outs are written by the CRUD layer into the same file.
        let database_path = PathBuf::from(require("SMSQ_DATABASE_PATH")?);
        let listen_raw = get("SMSQ_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8000".to_string());
        let listen_addr = listen_raw
            .parse::<SocketAddr>()
            .map_err(|e| Error::Config(format!("SMSQ_LISTEN_ADDR is invalid ({listen_raw}): {e}")))?;

        Ok(Self {
            carrier,
            dispatch,
            correlator,
            runtime,
            account_min_send_interval,
            database_path,
            listen_addr,
        })
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() || env::var_os(key).is_some() {
            continue; // never override the real environment
        }

        env::set_var(key, strip_quotes(v.trim()));
    }
}

fn strip_quotes(val: &str) -> &str {
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        &val[1..val.len() - 1]
    } else {
        val
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn base() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("VONAGE_API_KEY", "key"),
            ("VONAGE_API_SECRET", "secret"),
            ("MESSAGE_STATUS_URL", "https://example.test/messages/status"),
            ("MESSAGE_REPLY_URL", "https://example.test/messages/inbound"),
            ("SMSQ_DATABASE_PATH", "/var/lib/smsq/smsq.db"),
        ])
    }

    fn load(vars: &HashMap<&'static str, &'static str>) -> Result<Config> {
        Config::from_lookup(|k| vars.get(k).map(|v| v.to_string()))
    }

    #[test]
    fn defaults_apply() {
        let cfg = load(&base()).unwrap();
        assert_eq!(cfg.carrier.base_url, "https://rest.nexmo.com");
        assert_eq!(cfg.carrier.country, "US");
        assert_eq!(cfg.carrier.timeout, Duration::from_secs(10));
        assert_eq!(cfg.correlator.stop_keyword, "stop");
        assert_eq!(cfg.runtime.max_attempts, 3);
        assert_eq!(cfg.account_min_send_interval, Duration::from_millis(34));
        assert_eq!(cfg.database_path, PathBuf::from("/var/lib/smsq/smsq.db"));
        assert_eq!(cfg.listen_addr.port(), 8000);
    }

    #[test]
    fn missing_credentials_fail() {
        let mut vars = base();
        vars.remove("VONAGE_API_SECRET");
        match load(&vars).unwrap_err() {
            Error::Config(msg) => assert!(msg.contains("VONAGE_API_SECRET")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn overrides_are_parsed() {
        let mut vars = base();
        vars.insert("STOP_KEYWORD", "UNSUBSCRIBE");
        vars.insert("TASK_MAX_ATTEMPTS", "5");
        vars.insert("VONAGE_BASE_URL", "http://localhost:9999/");
        vars.insert("SMSQ_DATABASE_PATH", "/tmp/smsq.db");
        let cfg = load(&vars).unwrap();
        assert_eq!(cfg.correlator.stop_keyword, "unsubscribe");
        assert_eq!(cfg.runtime.max_attempts, 5);
        assert_eq!(cfg.carrier.base_url, "http://localhost:9999");
        assert_eq!(cfg.database_path, PathBuf::from("/tmp/smsq.db"));

        vars.insert("TASK_RETRY_BACKOFF_MS", "soon");
        assert!(matches!(load(&vars).unwrap_err(), Error::Config(_)));
    }

    #[test]
    fn database_path_is_required() {
        let mut vars = base();
        vars.remove("SMSQ_DATABASE_PATH");
        match load(&vars).unwrap_err() {
            Error::Config(msg) => assert!(msg.contains("SMSQ_DATABASE_PATH")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn attempt_limit_must_fit_u32() {
        let mut vars = base();
        vars.insert("TASK_MAX_ATTEMPTS", "4294967296");
        match load(&vars).unwrap_err() {
            Error::Config(msg) => assert!(msg.contains("TASK_MAX_ATTEMPTS"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }

        vars.insert("TASK_MAX_ATTEMPTS", "0");
        assert!(matches!(load(&vars).unwrap_err(), Error::Config(_)));

        vars.insert("TASK_MAX_ATTEMPTS", "4294967295");
        assert_eq!(load(&vars).unwrap().runtime.max_attempts, u32::MAX);
    }

    #[test]
    fn strips_quotes() {
        assert_eq!(strip_quotes("\"abc\""), "abc");
        assert_eq!(strip_quotes("'x'"), "x");
        assert_eq!(strip_quotes("plain"), "plain");
    }
}
