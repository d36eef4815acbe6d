use std::env;
use std::str::FromStr;
use tracing::warn;

/// Upper bound for the conversation idle timeout: one week.
pub const MAX_IDLE_TIMEOUT_SECONDS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_jwt_secret: String,
    pub redis_url: Option<String>,
    pub center_id: String,
    pub whatsapp_api_base_url: String,
    pub whatsapp_phone_number_id: String,
    pub whatsapp_access_token: String,
    pub whatsapp_verify_token: String,
    pub whatsapp_app_secret: Option<String>,
    pub classifier_api_url: Option<String>,
    pub classifier_api_key: Option<String>,
    pub classifier_model: String,
    pub conversation_idle_timeout_seconds: u64,
    pub directory_cache_ttl_seconds: u64,
    pub booking_days_ahead: u32,
    pub handoff_notify_phone: Option<String>,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_JWT_SECRET not set, using empty value");
                    String::new()
                }),
            redis_url: optional_var("REDIS_URL"),
            center_id: env::var("CENTER_ID")
                .unwrap_or_else(|_| {
                    warn!("CENTER_ID not set, using default");
                    "default".to_string()
                }),
            whatsapp_api_base_url: env::var("WHATSAPP_API_BASE_URL")
                .unwrap_or_else(|_| "https://graph.facebook.com/v19.0".to_string()),
            whatsapp_phone_number_id: env::var("WHATSAPP_PHONE_NUMBER_ID")
                .unwrap_or_else(|_| {
                    warn!("WHATSAPP_PHONE_NUMBER_ID not set, using empty value");
                    String::new()
                }),
            whatsapp_access_token: env::var("WHATSAPP_ACCESS_TOKEN")
                .unwrap_or_else(|_| {
                    warn!("WHATSAPP_ACCESS_TOKEN not set, using empty value");
                    String::new()
                }),
            whatsapp_verify_token: env::var("WHATSAPP_VERIFY_TOKEN")
                .unwrap_or_else(|_| {
                    warn!("WHATSAPP_VERIFY_TOKEN not set, using empty value");
                    String::new()
                }),
            whatsapp_app_secret: optional_var("WHATSAPP_APP_SECRET"),
            classifier_api_url: optional_var("CLASSIFIER_API_URL"),
            classifier_api_key: optional_var("CLASSIFIER_API_KEY"),
            classifier_model: env::var("CLASSIFIER_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            conversation_idle_timeout_seconds: parsed_var("CONVERSATION_IDLE_TIMEOUT_SECONDS", 1800),
            directory_cache_ttl_seconds: parsed_var("DIRECTORY_CACHE_TTL_SECONDS", 300),
            booking_days_ahead: parsed_var("BOOKING_DAYS_AHEAD", 7),
            handoff_notify_phone: optional_var("HANDOFF_NOTIFY_PHONE"),
            port: parsed_var("PORT", 3000),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
            && !self.supabase_jwt_secret.is_empty()
    }

    pub fn is_whatsapp_configured(&self) -> bool {
        !self.whatsapp_phone_number_id.is_empty()
            && !self.whatsapp_access_token.is_empty()
    }

    pub fn is_classifier_configured(&self) -> bool {
        self.classifier_api_url.is_some() && self.classifier_api_key.is_some()
    }

    /// Conversation idle timeout, capped at `MAX_IDLE_TIMEOUT_SECONDS`.
    pub fn idle_timeout_seconds(&self) -> u64 {
        self.conversation_idle_timeout_seconds.min(MAX_IDLE_TIMEOUT_SECONDS)
    }
}

fn optional_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parsed_var<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has invalid value {:?}, using default {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_idle_timeout(seconds: u64) -> AppConfig {
        AppConfig {
            supabase_url: String::new(),
            supabase_anon_key: String::new(),
            supabase_jwt_secret: String::new(),
            redis_url: None,
            center_id: "center-1".to_string(),
            whatsapp_api_base_url: String::new(),
            whatsapp_phone_number_id: String::new(),
            whatsapp_access_token: String::new(),
            whatsapp_verify_token: String::new(),
            whatsapp_app_secret: None,
            classifier_api_url: None,
            classifier_api_key: None,
            classifier_model: String::new(),
            conversation_idle_timeout_seconds: seconds,
            directory_cache_ttl_seconds: 300,
            booking_days_ahead: 7,
            handoff_notify_phone: None,
            port: 3000,
        }
    }

    #[test]
    fn idle_timeout_is_capped() {
        assert_eq!(config_with_idle_timeout(1800).idle_timeout_seconds(), 1800);
        assert_eq!(config_with_idle_timeout(u64::MAX).idle_timeout_seconds(), MAX_IDLE_TIMEOUT_SECONDS);
    }
}
