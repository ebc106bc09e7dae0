use super::parsing::{
    env_optional, env_or_default, parse_bool, parse_cors_origins, parse_environment, parse_f64,
    parse_i64, parse_string_list, parse_u16, parse_u32, parse_u64,
};
use super::secret::load_or_create_secret_key;
use super::types::{
    AdminSettings, ApiSettings, ConfigError, CorsSettings, CreditsSettings, DatabaseSettings,
    ExtractorSettings, GradingSettings, RedisSettings, RuntimeSettings, SecuritySettings,
    ServerHost, ServerPort, ServerSettings, Settings, TelemetrySettings, UploadSettings,
    WorkerSettings,
};

const DEFAULT_SUPPORTED_MIME_TYPES: &[&str] = &[
    "application/pdf",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "image/jpeg",
    "image/png",
    "text/plain",
];

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let host = env_or_default("RUBRICA_HOST", "0.0.0.0");
        let port = parse_u16("RUBRICA_PORT", env_or_default("RUBRICA_PORT", "8000"))?;

        let environment =
            parse_environment(env_optional("RUBRICA_ENV").or_else(|| env_optional("ENVIRONMENT")));
        let strict_config =
            env_optional("RUBRICA_STRICT_CONFIG").map(|value| parse_bool(&value)).unwrap_or(false)
                || environment.is_production();

        let project_name = env_or_default("PROJECT_NAME", "Rubrica API");
        let version = env_or_default("VERSION", env!("CARGO_PKG_VERSION"));
        let api_v1_str = env_or_default("API_V1_STR", "/api/v1");

        let secret_key = match env_optional("SECRET_KEY") {
            Some(value) => value,
            None => {
                if strict_config {
                    return Err(ConfigError::MissingRequired("SECRET_KEY"));
                }
                load_or_create_secret_key()
            }
        };

        let access_token_expire_minutes = parse_u64(
            "ACCESS_TOKEN_EXPIRE_MINUTES",
            env_or_default("ACCESS_TOKEN_EXPIRE_MINUTES", "10080"),
        )?;
        let algorithm = env_or_default("ALGORITHM", "HS256");

        let cors_origins = parse_cors_origins(env_optional("BACKEND_CORS_ORIGINS"))?;

        let postgres_server = env_or_default("POSTGRES_SERVER", "localhost");
        let postgres_port = parse_u16("POSTGRES_PORT", env_or_default("POSTGRES_PORT", "5432"))?;
        let postgres_user = env_or_default("POSTGRES_USER", "rubrica");
        let postgres_password = env_or_default("POSTGRES_PASSWORD", "");
        let postgres_db = env_or_default("POSTGRES_DB", "rubrica_db");
        let database_url = env_optional("DATABASE_URL");

        let redis_host = env_or_default("REDIS_HOST", "localhost");
        let redis_port = parse_u16("REDIS_PORT", env_or_default("REDIS_PORT", "6379"))?;
        let redis_db = parse_u16("REDIS_DB", env_or_default("REDIS_DB", "0"))?;
        let redis_password = env_or_default("REDIS_PASSWORD", "");
        let events_channel = env_or_default("JOB_EVENTS_CHANNEL", "rubrica:job-events");

        let grading_api_key = env_or_default("OPENAI_API_KEY", "");
        let grading_base_url = env_or_default("OPENAI_BASE_URL", "https://api.openai.com/v1");
        let fast_model = env_or_default("GRADING_FAST_MODEL", "gpt-4o-mini");
        let quality_model = env_or_default("GRADING_QUALITY_MODEL", "gpt-4o");
        let grading_max_tokens =
            parse_u32("GRADING_MAX_TOKENS", env_or_default("GRADING_MAX_TOKENS", "8000"))?;
        let grading_temperature =
            parse_f64("GRADING_TEMPERATURE", env_or_default("GRADING_TEMPERATURE", "0.0"))?;
        let grading_request_timeout_seconds = parse_u64(
            "GRADING_REQUEST_TIMEOUT_SECONDS",
            env_or_default("GRADING_REQUEST_TIMEOUT_SECONDS", "60"),
        )?;
        let grading_max_attempts =
            parse_u32("GRADING_MAX_ATTEMPTS", env_or_default("GRADING_MAX_ATTEMPTS", "3"))?;
        let confidence_threshold = parse_f64(
            "GRADING_CONFIDENCE_THRESHOLD",
            env_or_default("GRADING_CONFIDENCE_THRESHOLD", "0.7"),
        )?;
        if !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "GRADING_CONFIDENCE_THRESHOLD",
                value: confidence_threshold.to_string(),
            });
        }

        let extractor_base_url = env_or_default("EXTRACTOR_BASE_URL", "");
        let extractor_api_key = env_or_default("EXTRACTOR_API_KEY", "");
        let extraction_timeout_seconds = parse_u64(
            "EXTRACTION_TIMEOUT_SECONDS",
            env_or_default("EXTRACTION_TIMEOUT_SECONDS", "30"),
        )?;
        let supported_mime_types = parse_string_list(
            env_optional("EXTRACTOR_SUPPORTED_MIME_TYPES"),
            DEFAULT_SUPPORTED_MIME_TYPES,
        );

        let fast_per_page =
            parse_i64("CREDITS_FAST_PER_PAGE", env_or_default("CREDITS_FAST_PER_PAGE", "2"))?;
        let quality_per_page =
            parse_i64("CREDITS_QUALITY_PER_PAGE", env_or_default("CREDITS_QUALITY_PER_PAGE", "5"))?;
        let fast_per_1k_tokens =
            parse_i64("CREDITS_FAST_PER_1K_TOKENS", env_or_default("CREDITS_FAST_PER_1K_TOKENS", "1"))?;
        let quality_per_1k_tokens = parse_i64(
            "CREDITS_QUALITY_PER_1K_TOKENS",
            env_or_default("CREDITS_QUALITY_PER_1K_TOKENS", "3"),
        )?;

        let worker_concurrency =
            parse_u64("WORKER_CONCURRENCY", env_or_default("WORKER_CONCURRENCY", "3"))? as usize;
        let stale_after_seconds = parse_u64(
            "STALE_JOB_TIMEOUT_SECONDS",
            env_or_default("STALE_JOB_TIMEOUT_SECONDS", "900"),
        )?;

        let max_upload_size_mb =
            parse_u64("MAX_UPLOAD_SIZE_MB", env_or_default("MAX_UPLOAD_SIZE_MB", "10"))?;
        let max_files_per_job =
            parse_u64("MAX_FILES_PER_JOB", env_or_default("MAX_FILES_PER_JOB", "20"))?;
        let jobs_per_minute =
            parse_u64("JOBS_PER_MINUTE", env_or_default("JOBS_PER_MINUTE", "10"))?;

        let admin_user_id = env_or_default("ADMIN_USER_ID", "admin");
        let admin_display_name = env_or_default("ADMIN_DISPLAY_NAME", "Administrator");
        let admin_starting_credits =
            parse_i64("ADMIN_STARTING_CREDITS", env_or_default("ADMIN_STARTING_CREDITS", "1000"))?;

        let log_level = env_or_default("LOG_LEVEL", "info");
        let log_json = env_optional("LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        if strict_config {
            if grading_api_key.is_empty() {
                return Err(ConfigError::MissingRequired("OPENAI_API_KEY"));
            }
            if extractor_base_url.is_empty() {
                return Err(ConfigError::MissingRequired("EXTRACTOR_BASE_URL"));
            }
        }

        Ok(Settings {
            server: ServerSettings { host: ServerHost(host), port: ServerPort(port) },
            runtime: RuntimeSettings { environment, strict_config },
            api: ApiSettings { project_name, version, api_v1_str },
            security: SecuritySettings { secret_key, access_token_expire_minutes, algorithm },
            cors: CorsSettings { origins: cors_origins },
            database: DatabaseSettings {
                postgres_server,
                postgres_port,
                postgres_user,
                postgres_password,
                postgres_db,
                database_url,
            },
            redis: RedisSettings {
                host: redis_host,
                port: redis_port,
                db: redis_db,
                password: redis_password,
                events_channel,
            },
            grading: GradingSettings {
                api_key: grading_api_key,
                base_url: grading_base_url,
                fast_model,
                quality_model,
                max_tokens: grading_max_tokens,
                temperature: grading_temperature,
                request_timeout_seconds: grading_request_timeout_seconds,
                max_attempts: grading_max_attempts,
                confidence_threshold,
            },
            extractor: ExtractorSettings {
                base_url: extractor_base_url,
                api_key: extractor_api_key,
                timeout_seconds: extraction_timeout_seconds,
                supported_mime_types,
            },
            credits: CreditsSettings {
                fast_per_page,
                quality_per_page,
                fast_per_1k_tokens,
                quality_per_1k_tokens,
            },
            worker: WorkerSettings {
                concurrency: worker_concurrency,
                stale_after_seconds,
            },
            upload: UploadSettings { max_upload_size_mb, max_files_per_job, jobs_per_minute },
            admin: AdminSettings { admin_user_id, admin_display_name, admin_starting_credits },
            telemetry: TelemetrySettings {
                log_level,
                json: log_json,
                prometheus_enabled,
            },
        })
    }
}
