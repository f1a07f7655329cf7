//! TOML configuration for recorders and delivery pipelines
//!
//! # Example shadowstack.toml
//!
//! ```toml
//! [pipeline]
//! capacity = 4096
//! batch_size = 20
//! overflow = "drop_oldest"
//! max_batch_latency_ms = 500
//!
//! [throttle]
//! type = "rate"
//! max = 2
//! per_ms = 1000
//!
//! # Scrub in the evaluated copy only
//! [[filter]]
//! policy = "noise"
//! type_name = "Foo"
//! fields = ["timestamp"]
//!
//! # Scrub in both copies, selected by tag
//! [[filter]]
//! policy = "secret"
//! type_name = "Baz"
//!
//! [[tag]]
//! type_name = "Baz"
//! field = "salary"
//! tags = ["secret"]
//! ```

use crate::filter::{noise, secrets, FieldFilterBuilder, ObjectFilter, TagTable};
use crate::interceptor::Recorder;
use crate::pipeline::{default_workers, DeliveryPipeline, OverflowPolicy, PipelineConfig};
use crate::sink::Sink;
use crate::throttle::{every, percent, rate, Throttle};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Root of shadowstack.toml
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ShadowConfig {
    #[serde(default)]
    pub pipeline: PipelineSection,

    /// No throttle: every call is recorded
    #[serde(default)]
    pub throttle: Option<ThrottleSection>,

    #[serde(default)]
    pub filter: Vec<FilterSection>,

    #[serde(default)]
    pub tag: Vec<TagSection>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSection {
    pub capacity: usize,
    pub batch_size: usize,
    /// Defaults to available parallelism
    pub workers: Option<usize>,
    pub overflow: OverflowPolicy,
    pub max_batch_latency_ms: Option<u64>,
    pub idle_poll_ms: u64,
    pub flush_on_shutdown: bool,
}

impl Default for PipelineSection {
    fn default() -> Self {
        let defaults = PipelineConfig::default();
        Self {
            capacity: defaults.capacity,
            batch_size: defaults.batch_size,
            workers: None,
            overflow: defaults.overflow,
            max_batch_latency_ms: None,
            idle_poll_ms: 10,
            flush_on_shutdown: defaults.flush_on_shutdown,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ThrottleSection {
    Percentage { fraction: f64 },
    Rate { max: u64, per_ms: u64 },
    Every { interval_ms: u64 },
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilterPolicy {
    Noise,
    Secret,
}

/// One `[[filter]]` entry; without `fields` or `tag` the policy's own tag is used
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FilterSection {
    pub policy: FilterPolicy,
    pub type_name: String,
    #[serde(default)]
    pub fields: Option<Vec<String>>,
    #[serde(default)]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TagSection {
    pub type_name: String,
    pub field: String,
    pub tags: Vec<String>,
}

impl ShadowConfig {
    /// Load configuration from a TOML file
    ///
    /// ```no_run
    /// use shadowstack::config::ShadowConfig;
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let config = ShadowConfig::from_file("shadowstack.toml")?;
    /// config.validate()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML")
    }

    /// Check that every section converts into its runtime type
    pub fn validate(&self) -> Result<()> {
        self.pipeline_config()
            .validate()
            .context("Invalid [pipeline] section")?;
        self.throttle().context("Invalid [throttle] section")?;
        self.object_filter().context("Invalid [[filter]] section")?;
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let section = &self.pipeline;
        PipelineConfig {
            capacity: section.capacity,
            batch_size: section.batch_size,
            workers: section.workers.unwrap_or_else(default_workers),
            overflow: section.overflow,
            max_batch_latency: section.max_batch_latency_ms.map(Duration::from_millis),
            idle_poll: Duration::from_millis(section.idle_poll_ms),
            flush_on_shutdown: section.flush_on_shutdown,
        }
    }

    pub fn throttle(&self) -> Result<Option<Arc<dyn Throttle>>> {
        let throttle: Arc<dyn Throttle> = match self.throttle {
            None => return Ok(None),
            Some(ThrottleSection::Percentage { fraction }) => Arc::new(percent(fraction)?),
            Some(ThrottleSection::Rate { max, per_ms }) => {
                Arc::new(rate(max).per(Duration::from_millis(per_ms))?)
            }
            Some(ThrottleSection::Every { interval_ms }) => {
                Arc::new(every(Duration::from_millis(interval_ms))?)
            }
        };
        Ok(Some(throttle))
    }

    pub fn tag_table(&self) -> TagTable {
        let mut table = TagTable::new();
        for entry in &self.tag {
            for tag in &entry.tags {
                table.insert(&entry.type_name, &entry.field, tag.as_str());
            }
        }
        table
    }

    pub fn object_filter(&self) -> Result<ObjectFilter> {
        let mut builder = ObjectFilter::builder().tags(self.tag_table());
        for (index, section) in self.filter.iter().enumerate() {
            builder = builder.with(
                section
                    .field_filter()
                    .with_context(|| format!("filter #{} ({})", index, section.type_name))?,
            );
        }
        Ok(builder.build()?)
    }

    /// Apply the filter and throttle sections to `recorder`
    pub fn configure(&self, recorder: Recorder) -> Result<Recorder> {
        let mut recorder = recorder.filtering_with(self.object_filter()?);
        if let Some(throttle) = self.throttle()? {
            recorder = recorder.throttling_to_shared(throttle);
        }
        Ok(recorder)
    }

    /// Start a delivery pipeline sized by the `[pipeline]` section
    pub fn start_pipeline(&self, sink: Arc<dyn Sink>) -> Result<DeliveryPipeline> {
        DeliveryPipeline::start(self.pipeline_config(), sink)
            .context("Failed to start delivery pipeline")
    }
}

impl FilterSection {
    fn field_filter(&self) -> Result<FieldFilterBuilder> {
        let builder = match self.policy {
            FilterPolicy::Noise => noise(),
            FilterPolicy::Secret => secrets(),
        }
        .from(self.type_name.as_str());

        Ok(match (&self.fields, &self.tag) {
            (Some(_), Some(_)) => bail!("`fields` and `tag` are mutually exclusive"),
            (Some(fields), None) => builder.named(fields.iter().cloned()),
            (None, Some(tag)) => builder.tagged(tag.as_str()),
            (None, None) => builder,
        })
    }
}
