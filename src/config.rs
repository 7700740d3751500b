use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::candidate::Category;
use crate::weights::WeightBounds;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Shared time budget for one fan-out.
    pub budget: Duration,
    /// How long a SUCCESS stays eligible to mark a later failure as FALLBACK.
    pub cache_ttl: Duration,
    /// Consecutive failures before a source is disabled.
    pub breaker_threshold: u32,
    pub disabled_sources: Vec<String>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            budget: Duration::from_millis(2_500),
            cache_ttl: Duration::from_secs(900),
            breaker_threshold: 5,
            disabled_sources: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Symmetric bound of the context modifier.
    pub context_max: f64,
    /// Cap on the sum of all boosts.
    pub boost_cap_total: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            context_max: 0.35,
            boost_cap_total: 1.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TierConfig {
    pub super_majority_k: usize,
    pub super_majority_threshold: f64,
    pub high_threshold: f64,
    /// Per-source minimums for the high-conviction tier, in check order.
    pub gates: Vec<(String, f64)>,
    pub floors: BTreeMap<Category, f64>,
    pub watch_floor: f64,
}

impl Default for TierConfig {
    fn default() -> Self {
        let mut floors = BTreeMap::new();
        floors.insert(Category::Game, 7.0);
        floors.insert(Category::Prop, 6.5);
        Self {
            super_majority_k: 3,
            super_majority_threshold: 8.0,
            high_threshold: 7.5,
            gates: vec![
                ("model".to_string(), 6.8),
                ("market".to_string(), 6.5),
                ("trigger".to_string(), 6.5),
                ("symbolic".to_string(), 5.5),
            ],
            floors,
            watch_floor: 5.5,
        }
    }
}

impl TierConfig {
    /// Category floor. Unconfigured categories get the strictest configured
    /// floor.
    pub fn floor(&self, category: Category) -> f64 {
        self.floors
            .get(&category)
            .copied()
            .unwrap_or_else(|| self.floors.values().copied().fold(self.high_threshold, f64::max))
    }
}

#[derive(Debug, Clone)]
pub struct LearningConfig {
    pub window_days: u64,
    pub categories: Vec<Category>,
    pub learning_rate: f64,
    /// Largest absolute change of one weight in one cycle.
    pub max_step: f64,
    pub min_samples: usize,
    pub bounds: WeightBounds,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            window_days: 7,
            categories: Category::all().to_vec(),
            learning_rate: 0.10,
            max_step: 0.03,
            min_samples: 30,
            bounds: WeightBounds::default(),
        }
    }
}

impl LearningConfig {
    pub fn window_secs(&self) -> u64 {
        self.window_days * 86_400
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub store_dir: PathBuf,
    pub ledger_path: String,
    pub request_timeout: Duration,
    pub collector: CollectorConfig,
    pub aggregator: AggregatorConfig,
    pub tiers: TierConfig,
    pub learning: LearningConfig,
    /// Remote endpoints per source id (`SOURCE_<ID>_URL`).
    pub source_urls: BTreeMap<String, String>,
    pub grading_url: Option<String>,
    pub grades_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("./data"),
            ledger_path: "./data/learning.sqlite".to_string(),
            request_timeout: Duration::from_secs(10),
            collector: CollectorConfig::default(),
            aggregator: AggregatorConfig::default(),
            tiers: TierConfig::default(),
            learning: LearningConfig::default(),
            source_urls: BTreeMap::new(),
            grading_url: None,
            grades_file: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Config::default();

        let mut tiers = d.tiers.clone();
        tiers.super_majority_k = env_or("SUPER_MAJORITY_K", tiers.super_majority_k);
        tiers.super_majority_threshold = env_or("SUPER_MAJORITY_TH", tiers.super_majority_threshold);
        tiers.high_threshold = env_or("HIGH_TH", tiers.high_threshold);
        tiers.watch_floor = env_or("WATCH_FLOOR", tiers.watch_floor);
        tiers.floors.insert(Category::Game, env_or("GAME_FLOOR", tiers.floor(Category::Game)));
        tiers.floors.insert(Category::Prop, env_or("PROP_FLOOR", tiers.floor(Category::Prop)));

        let mut learning = d.learning.clone();
        learning.window_days = env_or("LEARN_WINDOW_DAYS", learning.window_days);
        learning.learning_rate = env_or("LEARN_RATE", learning.learning_rate);
        learning.max_step = env_or("LEARN_MAX_STEP", learning.max_step);
        learning.min_samples = env_or("LEARN_MIN_SAMPLES", learning.min_samples);
        learning.bounds.engine_min = env_or("WEIGHT_MIN", learning.bounds.engine_min);
        learning.bounds.engine_max = env_or("WEIGHT_MAX", learning.bounds.engine_max);
        let categories: Vec<Category> = env_list("LEARN_CATEGORIES")
            .iter()
            .filter_map(|c| Category::parse(c))
            .collect();
        if !categories.is_empty() {
            learning.categories = categories;
        }

        let source_urls = crate::weights::REFERENCE_SOURCES
            .iter()
            .filter_map(|id| {
                std::env::var(format!("SOURCE_{}_URL", id.to_uppercase()))
                    .ok()
                    .map(|url| (id.to_string(), url))
            })
            .collect();

        let store_dir = PathBuf::from(std::env::var("STORE_DIR").unwrap_or_else(|_| "./data".to_string()));
        let ledger_path = std::env::var("LEDGER_PATH")
            .unwrap_or_else(|_| store_dir.join("learning.sqlite").to_string_lossy().to_string());

        Self {
            store_dir,
            ledger_path,
            request_timeout: Duration::from_millis(env_or("REQUEST_TIMEOUT_MS", 10_000)),
            collector: CollectorConfig {
                budget: Duration::from_millis(env_or("SOURCE_BUDGET_MS", 2_500)),
                cache_ttl: Duration::from_secs(env_or("CACHE_TTL_SECS", 900)),
                breaker_threshold: env_or("BREAKER_THRESHOLD", d.collector.breaker_threshold),
                disabled_sources: env_list("DISABLED_SOURCES"),
            },
            aggregator: AggregatorConfig {
                context_max: env_or("CONTEXT_MAX", d.aggregator.context_max),
                boost_cap_total: env_or("BOOST_CAP_TOTAL", d.aggregator.boost_cap_total),
            },
            tiers,
            learning,
            source_urls,
            grading_url: std::env::var("GRADING_URL").ok(),
            grades_file: std::env::var("GRADES_FILE").ok(),
        }
    }
}

pub fn now_ts() -> u64 {
    chrono::Utc::now().timestamp() as u64
}
