use crate::models::{Instrument, MarketRules, Timeframe};
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Keys recognised in the configuration document (lowercase; the loader is case-insensitive)
const KNOWN_KEYS: &[&str] = &[
    "exchange",
    "sandbox",
    "dry_run",
    "symbols",
    "timeframe",
    "risk_per_trade_pct",
    "breakout_lookback",
    "stop_lookback",
    "use_atr_stop",
    "atr_mult",
    "max_spread_pct",
    "take_profit_r",
    "tp_fraction",
    "trailing_use_atr",
    "kill_switch_daily_dd_pct",
    "poll_seconds",
    "journal_csv",
    "fiat",
    "use_websocket",
    "ws_reconnect_sec",
    "sound_alerts",
    "dashboard_clear",
    "starting_equity",
    "request_timeout_secs",
    "log_dir",
    "history_limit",
];

const SUPPORTED_EXCHANGES: &[&str] = &["binance"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Symbol '{symbol}' unavailable on {exchange}. Valid examples: {examples:?}")]
    UnknownInstrument {
        symbol: String,
        exchange: String,
        examples: Vec<String>,
    },
}

/// Bot configuration, read once at startup
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub exchange: String,
    pub sandbox: bool,
    pub dry_run: bool,
    #[serde(deserialize_with = "one_or_many")]
    pub symbols: Vec<String>,
    #[serde(deserialize_with = "timeframe_from_str")]
    pub timeframe: Timeframe,
    pub risk_per_trade_pct: f64,
    pub breakout_lookback: usize,
    pub stop_lookback: usize,
    pub use_atr_stop: bool,
    pub atr_mult: f64,
    pub max_spread_pct: f64,
    #[serde(alias = "take_profit_R")]
    pub take_profit_r: f64,
    pub tp_fraction: f64,
    pub trailing_use_atr: bool,
    pub kill_switch_daily_dd_pct: f64,
    pub poll_seconds: u64,
    pub journal_csv: String,
    pub fiat: String,
    pub use_websocket: bool,
    pub ws_reconnect_sec: f64,
    pub sound_alerts: bool,
    pub dashboard_clear: bool,
    pub starting_equity: f64,
    pub request_timeout_secs: u64,
    pub log_dir: String,
    pub history_limit: usize,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            exchange: "binance".to_string(),
            sandbox: false,
            dry_run: true,
            symbols: vec!["BTC/USDT".to_string()],
            timeframe: Timeframe::default(),
            risk_per_trade_pct: 1.0,
            breakout_lookback: 20,
            stop_lookback: 10,
            use_atr_stop: false,
            atr_mult: 2.0,
            max_spread_pct: 0.5,
            take_profit_r: 1.0,
            tp_fraction: 0.5,
            trailing_use_atr: true,
            kill_switch_daily_dd_pct: -3.0,
            poll_seconds: 60,
            journal_csv: "trades.csv".to_string(),
            fiat: "USDT".to_string(),
            use_websocket: true,
            ws_reconnect_sec: 3.0,
            sound_alerts: true,
            dashboard_clear: true,
            starting_equity: 10_000.0,
            request_timeout_secs: 10,
            log_dir: "logs".to_string(),
            history_limit: 200,
        }
    }
}

impl BotConfig {
    /// Load from a YAML file layered with `BOT_*` environment overrides
    ///
    /// A missing file is not an error: every key takes its default.
    /// Unknown keys are reported once each and ignored.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut builder = config::Config::builder();

        if path.exists() {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
        }

        let settings = builder
            .add_source(
                Environment::with_prefix("BOT")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("symbols"),
            )
            .build()?;

        let raw: HashMap<String, config::Value> = settings.clone().try_deserialize()?;
        for key in unknown_keys(raw.keys()) {
            tracing::warn!(key = %key, "Unknown config key ignored");
        }

        let cfg: BotConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let exchange = self.exchange.to_lowercase();
        if !SUPPORTED_EXCHANGES.contains(&exchange.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "unsupported exchange '{}'",
                self.exchange
            )));
        }
        if self.symbols.is_empty() {
            return Err(ConfigError::Invalid("symbols must not be empty".into()));
        }
        if self.breakout_lookback == 0 || self.stop_lookback == 0 {
            return Err(ConfigError::Invalid("lookbacks must be at least 1".into()));
        }
        if !(self.risk_per_trade_pct > 0.0 && self.risk_per_trade_pct <= 100.0) {
            return Err(ConfigError::Invalid(format!(
                "risk_per_trade_pct must be in (0, 100], got {}",
                self.risk_per_trade_pct
            )));
        }
        if !(0.0..=1.0).contains(&self.tp_fraction) {
            return Err(ConfigError::Invalid(format!(
                "tp_fraction must be in [0, 1], got {}",
                self.tp_fraction
            )));
        }
        if self.kill_switch_daily_dd_pct > 0.0 {
            return Err(ConfigError::Invalid(
                "kill_switch_daily_dd_pct must be zero or negative".into(),
            ));
        }
        if self.poll_seconds == 0 {
            return Err(ConfigError::Invalid("poll_seconds must be at least 1".into()));
        }
        if self.atr_mult <= 0.0 {
            return Err(ConfigError::Invalid("atr_mult must be positive".into()));
        }
        if self.starting_equity <= 0.0 {
            return Err(ConfigError::Invalid("starting_equity must be positive".into()));
        }
        if self.ws_reconnect_sec < 0.0 {
            return Err(ConfigError::Invalid("ws_reconnect_sec must not be negative".into()));
        }
        Ok(())
    }

    /// Candles a signal needs: `max(N_breakout, N_stop) + 2`
    pub fn min_history(&self) -> usize {
        self.breakout_lookback.max(self.stop_lookback) + 2
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_seconds)
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn reconnect_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.ws_reconnect_sec.max(0.0))
    }
}

fn unknown_keys<'a>(keys: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut unknown: Vec<String> = keys
        .filter(|k| !KNOWN_KEYS.contains(&k.to_lowercase().as_str()))
        .cloned()
        .collect();
    unknown.sort();
    unknown
}

/// Accept `symbols: BTC/USDT` as well as a list
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

fn timeframe_from_str<'de, D>(deserializer: D) -> Result<Timeframe, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

/// Validate configured symbols against the exchange's tradable markets
///
/// A `USUT` quote is corrected to `USDT` when that market exists.
/// Anything else unresolvable is fatal.
pub fn resolve_instruments(
    symbols: &[String],
    markets: &HashMap<String, MarketRules>,
    fiat: &str,
    exchange: &str,
) -> Result<Vec<Instrument>, ConfigError> {
    let is_tradable = |s: &str| markets.get(s).map(|m| m.tradable).unwrap_or(false);
    let mut instruments = Vec::with_capacity(symbols.len());

    for raw in symbols {
        let symbol = raw.trim().to_uppercase();

        let resolved = if is_tradable(&symbol) {
            symbol
        } else {
            let fixed = symbol.replace("USUT", "USDT");
            if fixed != symbol && is_tradable(&fixed) {
                tracing::warn!(from = %symbol, to = %fixed, "Symbol not found, corrected automatically");
                fixed
            } else {
                let suffix = format!("/{}", fiat.to_uppercase());
                let mut examples: Vec<String> = markets
                    .iter()
                    .filter(|(name, rules)| rules.tradable && name.ends_with(&suffix))
                    .map(|(name, _)| name.clone())
                    .collect();
                examples.sort();
                examples.truncate(10);

                return Err(ConfigError::UnknownInstrument {
                    symbol,
                    exchange: exchange.to_string(),
                    examples,
                });
            }
        };

        let instrument = resolved
            .parse::<Instrument>()
            .map_err(ConfigError::Invalid)?;
        instruments.push(instrument);
    }

    Ok(instruments)
}
