//! Transfer rule evaluation: directory rules, section flags, ratio rules.
//!
//! Every data-producing operation asks the pipeline for a decision before a
//! byte moves. The pipeline layers, in order: the longest-prefix directory
//! rule, the owning section, the section's named ratio rule, and finally the
//! group multipliers. The result is either a denial with a reason or the
//! composed accounting terms for the transfer.

use std::collections::BTreeMap;

use crate::config::{DirectoryRuleConfig, RatioRuleConfig};
use crate::section::{Section, SectionResolver};
use crate::users::Group;
use crate::vfs::path;

/// Operation class the pipeline is asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOp {
    Upload,
    Download,
    List,
}

/// Accounting terms for an allowed transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AllowTerms {
    pub free: bool,
    pub ratio_up: u32,
    pub ratio_down: u32,
    pub cost_mul: f64,
    pub upload_bonus: f64,
}

impl AllowTerms {
    /// Download debit in KiB: `ceil(bytes/1024) * down/up * cost_mul`, 0 when free.
    pub fn cost_kb(&self, bytes: u64) -> u64 {
        if self.free {
            return 0;
        }
        let kb = bytes.div_ceil(1024) as f64;
        let cost = kb * f64::from(self.ratio_down) / f64::from(self.ratio_up.max(1)) * self.cost_mul;
        cost.ceil().max(0.0) as u64
    }

    /// Upload bonus with the section ratio folded in; a 1:3 section pays
    /// three credits per uploaded KiB.
    pub fn effective_upload_bonus(&self) -> f64 {
        f64::from(self.ratio_down) / f64::from(self.ratio_up.max(1)) * self.upload_bonus
    }

    /// Upload credit in KiB: `ceil(bytes/1024) * down/up * upload_bonus`.
    pub fn earned_kb(&self, bytes: u64) -> u64 {
        let kb = bytes.div_ceil(1024) as f64;
        (kb * self.effective_upload_bonus()).ceil().max(0.0) as u64
    }
}

/// Outcome of a pipeline evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allow(AllowTerms),
    Deny(String),
}

impl Decision {
    pub fn terms(&self) -> Option<&AllowTerms> {
        match self {
            Decision::Allow(terms) => Some(terms),
            Decision::Deny(_) => None,
        }
    }
}

/// One directory rule keyed by its virtual path prefix.
#[derive(Debug, Clone)]
struct DirectoryRule {
    prefix: String,
    config: DirectoryRuleConfig,
}

/// The composed rule engine, rebuilt on every snapshot load.
#[derive(Debug)]
pub struct RatioPipeline {
    /// Sorted by descending prefix length, longest match wins.
    directory_rules: Vec<DirectoryRule>,
    ratio_rules: BTreeMap<String, RatioRuleConfig>,
}

impl RatioPipeline {
    pub fn new(
        directory_rules: &BTreeMap<String, DirectoryRuleConfig>,
        ratio_rules: &BTreeMap<String, RatioRuleConfig>,
    ) -> Self {
        let mut rules: Vec<DirectoryRule> = directory_rules
            .iter()
            .map(|(prefix, config)| DirectoryRule {
                prefix: path::normalize("/", prefix),
                config: config.clone(),
            })
            .collect();
        rules.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        let ratio_rules = ratio_rules
            .iter()
            .map(|(name, rule)| (name.to_ascii_uppercase(), rule.clone()))
            .collect();
        RatioPipeline { directory_rules: rules, ratio_rules }
    }

    fn directory_rule_for(&self, virtual_path: &str) -> Option<&DirectoryRuleConfig> {
        self.directory_rules
            .iter()
            .find(|rule| path::has_prefix(virtual_path, &rule.prefix))
            .map(|rule| &rule.config)
    }

    fn ratio_rule_for(&self, section: &Section) -> Option<&RatioRuleConfig> {
        self.ratio_rules.get(&section.name.to_ascii_uppercase())
    }

    /// Evaluates `op` on `virtual_path` for a member of `group`.
    ///
    /// Layering per step: directory rule denial, section denial, value
    /// composition (free is an OR; ratio is the first override; multipliers
    /// multiply), then the group multipliers on top.
    pub fn evaluate(
        &self,
        sections: &SectionResolver,
        group: &Group,
        virtual_path: &str,
        op: TransferOp,
    ) -> Decision {
        let dir_rule = self.directory_rule_for(virtual_path).filter(|r| r.enabled);
        if let Some(rule) = dir_rule {
            let blocked = match op {
                TransferOp::Upload => !rule.allow_upload,
                TransferOp::Download => !rule.allow_download,
                TransferOp::List => !rule.allow_list,
            };
            if blocked {
                return Decision::Deny(format!(
                    "directory rule blocks {} here",
                    op_name(op)
                ));
            }
        }

        let section = sections.section_for(virtual_path);
        let blocked = match op {
            TransferOp::Upload => !section.allow_upload,
            TransferOp::Download => !section.allow_download,
            TransferOp::List => false,
        };
        if blocked {
            return Decision::Deny(format!(
                "section {} does not allow {}",
                section.name,
                op_name(op)
            ));
        }

        let ratio_rule = self.ratio_rule_for(section);

        let free = dir_rule.and_then(|r| r.free).unwrap_or(false)
            || section.free_leech
            || ratio_rule.map(|r| r.free).unwrap_or(false);

        let (ratio_up, ratio_down) = dir_rule
            .and_then(|r| r.ratio)
            .or(Some((section.ratio_up, section.ratio_down)))
            .or(ratio_rule.and_then(|r| r.ratio))
            .unwrap_or((1, 1));

        let mut cost_mul = section.download_multiplier;
        if let Some(m) = dir_rule.and_then(|r| r.cost_multiplier) {
            cost_mul *= m;
        }
        if let Some(m) = ratio_rule.and_then(|r| r.cost_multiplier) {
            cost_mul *= m;
        }

        let mut upload_bonus = section.upload_multiplier;
        if let Some(b) = dir_rule.and_then(|r| r.upload_bonus) {
            upload_bonus *= b;
        }
        if let Some(b) = ratio_rule.and_then(|r| r.upload_bonus) {
            upload_bonus *= b;
        }

        cost_mul *= group.ratio_multiply;
        upload_bonus *= group.upload_bonus;

        Decision::Allow(AllowTerms { free, ratio_up: ratio_up.max(1), ratio_down, cost_mul, upload_bonus })
    }
}

fn op_name(op: TransferOp) -> &'static str {
    match op {
        TransferOp::Upload => "upload",
        TransferOp::Download => "download",
        TransferOp::List => "listing",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SectionConfig;
    use crate::users::Group;
    use std::collections::BTreeMap;

    fn sections() -> SectionResolver {
        let mut map = BTreeMap::new();
        map.insert("MP3".to_string(), SectionConfig {
            virtual_root: "/mp3".to_string(),
            ratio_up: 1,
            ratio_down: 3,
            upload_multiplier: 1.0,
            download_multiplier: 1.0,
            ..SectionConfig::default()
        });
        map.insert("REQ".to_string(), SectionConfig {
            virtual_root: "/requests".to_string(),
            allow_download: false,
            ..SectionConfig::default()
        });
        SectionResolver::new(map.iter())
    }

    fn neutral_group() -> Group {
        Group::new("users", "")
    }

    #[test]
    fn section_block_denies() {
        let pipeline = RatioPipeline::new(&BTreeMap::new(), &BTreeMap::new());
        let decision = pipeline.evaluate(
            &sections(),
            &neutral_group(),
            "/requests/some.file",
            TransferOp::Download,
        );
        assert!(matches!(decision, Decision::Deny(_)));
    }

    #[test]
    fn directory_rule_beats_section() {
        let mut dir_rules = BTreeMap::new();
        dir_rules.insert("/mp3/archive".to_string(), DirectoryRuleConfig {
            allow_upload: false,
            ..DirectoryRuleConfig::default()
        });
        let pipeline = RatioPipeline::new(&dir_rules, &BTreeMap::new());
        let denied = pipeline.evaluate(
            &sections(),
            &neutral_group(),
            "/mp3/archive/old",
            TransferOp::Upload,
        );
        assert!(matches!(denied, Decision::Deny(_)));
        let allowed =
            pipeline.evaluate(&sections(), &neutral_group(), "/mp3/new", TransferOp::Upload);
        assert!(matches!(allowed, Decision::Allow(_)));
    }

    #[test]
    fn disabled_directory_rule_is_skipped() {
        let mut dir_rules = BTreeMap::new();
        dir_rules.insert("/mp3".to_string(), DirectoryRuleConfig {
            enabled: false,
            allow_upload: false,
            ..DirectoryRuleConfig::default()
        });
        let pipeline = RatioPipeline::new(&dir_rules, &BTreeMap::new());
        let decision =
            pipeline.evaluate(&sections(), &neutral_group(), "/mp3/x", TransferOp::Upload);
        assert!(matches!(decision, Decision::Allow(_)));
    }

    #[test]
    fn download_cost_uses_section_ratio() {
        let pipeline = RatioPipeline::new(&BTreeMap::new(), &BTreeMap::new());
        let decision =
            pipeline.evaluate(&sections(), &neutral_group(), "/mp3/a.mp3", TransferOp::Download);
        let terms = decision.terms().expect("allowed");
        // 1 MiB at 1:3 costs 3072 KiB.
        assert_eq!(terms.cost_kb(1024 * 1024), 3072);
    }

    #[test]
    fn free_sources_compose_with_or() {
        let mut ratio_rules = BTreeMap::new();
        ratio_rules.insert("MP3".to_string(), RatioRuleConfig {
            free: true,
            ..RatioRuleConfig::default()
        });
        let pipeline = RatioPipeline::new(&BTreeMap::new(), &ratio_rules);
        let decision =
            pipeline.evaluate(&sections(), &neutral_group(), "/mp3/a.mp3", TransferOp::Download);
        let terms = decision.terms().expect("allowed");
        assert!(terms.free);
        assert_eq!(terms.cost_kb(1024 * 1024), 0);
    }

    #[test]
    fn group_multipliers_apply_last() {
        let pipeline = RatioPipeline::new(&BTreeMap::new(), &BTreeMap::new());
        let mut group = neutral_group();
        group.ratio_multiply = 0.5;
        group.upload_bonus = 2.0;
        let decision = pipeline.evaluate(&sections(), &group, "/mp3/a.mp3", TransferOp::Download);
        let terms = decision.terms().expect("allowed");
        // 1 MiB at 1:3 halved.
        assert_eq!(terms.cost_kb(1024 * 1024), 1536);
        // 1024 KiB * 3 (section ratio) * 2 (group bonus).
        assert_eq!(terms.earned_kb(1024 * 1024), 6144);
    }

    #[test]
    fn upload_earnings_round_up() {
        let terms = AllowTerms {
            free: false,
            ratio_up: 1,
            ratio_down: 1,
            cost_mul: 1.0,
            upload_bonus: 3.0,
        };
        // 900000 bytes is 879 KiB rounded up, times 3.
        assert_eq!(terms.earned_kb(900_000), 2637);
    }
}
