//! Settings for the shipper, read from the environment at startup. Any error here is fatal, the
//! process must not start ticking with a partial configuration.

use crate::error::{Error, Result};
use crate::metrics::DEFAULT_METRICS_PORT;
use crate::source::{
    CloudflareConfig, DEFAULT_BASE_URL, DEFAULT_PAGE_SIZE, DEFAULT_REQUEST_TIMEOUT,
};
use crate::watermark::{DEFAULT_MAX_LOOK_BACK, LookBack};
use std::collections::HashMap;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const ENV_API_EMAIL: &str = "CLOUDFLARE_API_EMAIL";
const ENV_API_KEY: &str = "CLOUDFLARE_API_KEY";
const ENV_ORGANIZATION_ID: &str = "CLOUDFLARE_ORGANIZATION_ID";
const ENV_TICK_INTERVAL_MINUTES: &str = "CLOUDFLARE_LOOK_BACK_INTERVAL";
const ENV_API_BASE_URL: &str = "CLOUDFLARE_API_BASE_URL";
const ENV_S3_BUCKET: &str = "AWS_S3_BUCKET_NAME";
const ENV_S3_ENDPOINT_URL: &str = "AWS_S3_ENDPOINT_URL";
const ENV_AWS_REGION: &str = "AWS_REGION";
const ENV_CHECKPOINT_KEY: &str = "AUDITSHIP_CHECKPOINT_KEY";
const ENV_MAX_LOOK_BACK_MINUTES: &str = "AUDITSHIP_MAX_LOOK_BACK_MINUTES";
const ENV_PAGE_SIZE: &str = "AUDITSHIP_PAGE_SIZE";
const ENV_FETCH_TIMEOUT_SECS: &str = "AUDITSHIP_FETCH_TIMEOUT_SECS";
const ENV_METRICS_PORT: &str = "AUDITSHIP_METRICS_PORT";
const ENV_WATERMARK_ADVANCE: &str = "AUDITSHIP_WATERMARK_ADVANCE";

const DEFAULT_TICK_INTERVAL_MINUTES: u64 = 5;
const DEFAULT_CHECKPOINT_KEY: &str = "lastProcessed.txt";

/// Which instant becomes the new watermark after a successful tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatermarkAdvance {
    /// Advance to the instant the drain finished. Events the remote API only makes visible after
    /// their own timestamp has passed the new watermark are not fetched again.
    #[default]
    TickEnd,
    /// Advance to the instant the tick started. Events created during the drain are fetched again
    /// on the next tick, trading duplicates for never skipping.
    TickStart,
}

impl FromStr for WatermarkAdvance {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tick-end" | "tick_end" => Ok(WatermarkAdvance::TickEnd),
            "tick-start" | "tick_start" => Ok(WatermarkAdvance::TickStart),
            other => Err(Error::Config(format!(
                "Unknown watermark advance policy {other:?}, expected tick-end or tick-start"
            ))),
        }
    }
}

/// Where the checkpoint lives, decided once from the settings.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointSettings {
    File {
        path: PathBuf,
    },
    S3 {
        bucket: String,
        key: String,
        region: Option<String>,
        endpoint_url: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub cloudflare: CloudflareConfig,
    pub look_back: LookBack,
    pub checkpoint: CheckpointSettings,
    pub metrics_port: u16,
    pub watermark_advance: WatermarkAdvance,
}

impl Settings {
    pub fn load(
        env_vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<Self> {
        let env_vars: HashMap<String, String> = env_vars
            .into_iter()
            .map(|(key, val)| (key.into(), val.into()))
            .filter(|(_key, val)| !val.trim().is_empty())
            .collect();

        let get_var = |var: &str| -> Result<String> {
            Ok(env_vars
                .get(var)
                .ok_or_else(|| Error::Config(format!("Must specify {var}")))?
                .trim()
                .to_string())
        };
        let get_opt_var = |var: &str| -> Option<String> {
            env_vars.get(var).map(|val| val.trim().to_string())
        };

        let tick_interval_minutes: u64 =
            parse_var(get_opt_var(ENV_TICK_INTERVAL_MINUTES), ENV_TICK_INTERVAL_MINUTES)?
                .unwrap_or(DEFAULT_TICK_INTERVAL_MINUTES);
        let max_look_back = parse_var::<u64>(
            get_opt_var(ENV_MAX_LOOK_BACK_MINUTES),
            ENV_MAX_LOOK_BACK_MINUTES,
        )?
        .map(minutes)
        .unwrap_or(DEFAULT_MAX_LOOK_BACK);
        let look_back = LookBack::new(minutes(tick_interval_minutes), max_look_back)?;

        let page_size: u32 = parse_var(get_opt_var(ENV_PAGE_SIZE), ENV_PAGE_SIZE)?
            .unwrap_or(DEFAULT_PAGE_SIZE);
        if page_size == 0 {
            return Err(Error::Config(format!("{ENV_PAGE_SIZE} must be positive")));
        }
        let request_timeout =
            parse_var::<u64>(get_opt_var(ENV_FETCH_TIMEOUT_SECS), ENV_FETCH_TIMEOUT_SECS)?
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let cloudflare = CloudflareConfig {
            base_url: get_opt_var(ENV_API_BASE_URL)
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_email: get_var(ENV_API_EMAIL)?,
            api_key: get_var(ENV_API_KEY)?,
            organization_id: get_var(ENV_ORGANIZATION_ID)?,
            page_size,
            request_timeout,
        };

        let checkpoint_key =
            get_opt_var(ENV_CHECKPOINT_KEY).unwrap_or_else(|| DEFAULT_CHECKPOINT_KEY.to_string());
        let checkpoint = match get_opt_var(ENV_S3_BUCKET) {
            Some(bucket) => CheckpointSettings::S3 {
                bucket,
                key: checkpoint_key,
                region: get_opt_var(ENV_AWS_REGION),
                endpoint_url: get_opt_var(ENV_S3_ENDPOINT_URL),
            },
            None => CheckpointSettings::File {
                path: PathBuf::from(checkpoint_key),
            },
        };

        let metrics_port = parse_var(get_opt_var(ENV_METRICS_PORT), ENV_METRICS_PORT)?
            .unwrap_or(DEFAULT_METRICS_PORT);
        let watermark_advance = get_opt_var(ENV_WATERMARK_ADVANCE)
            .map(|val| val.parse::<WatermarkAdvance>())
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            cloudflare,
            look_back,
            checkpoint,
            metrics_port,
            watermark_advance,
        })
    }
}

fn minutes(minutes: u64) -> Duration {
    Duration::from_secs(minutes.saturating_mul(60))
}

fn parse_var<T>(value: Option<String>, var: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .map(|val| {
            val.parse::<T>()
                .map_err(|e| Error::Config(format!("If {var} is set it must be a number: {e}")))
        })
        .transpose()
}
