//! Offline problem generation from parameterised templates.
//!
//! A unit map names units, their prerequisites and the templates available
//! per difficulty. Templates carry `${var}` placeholders that are filled with
//! small random integers.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::OnceLock;

use rand::Rng;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::domain::{Difficulty, GeneratedItem, TemplateError};

/// Prerequisite search depth.
const PREREQ_DEPTH: usize = 2;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitMap {
    pub units: BTreeMap<String, Unit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    #[serde(default)]
    pub id: String,
    pub title_ja: String,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub templates: BTreeMap<Difficulty, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionTemplate {
    pub id: String,
    pub unit_id: String,
    pub difficulty: Difficulty,
    pub stem: String,
    pub answer: String,
}

/// One instantiated template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateQuestion {
    pub id: String,
    pub template_id: String,
    pub unit_id: String,
    pub unit_title: String,
    pub difficulty: Difficulty,
    pub stem_latex: String,
    pub answer_latex: String,
}

impl TemplateQuestion {
    pub fn into_item(self) -> GeneratedItem {
        GeneratedItem::new(self.stem_latex, self.answer_latex, self.difficulty).with_unit(self.unit_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    pub unit_ids: Vec<String>,
    pub difficulties: Vec<Difficulty>,
    pub count: usize,
    /// Reserve 30% of the batch for prerequisite units at `L1`.
    pub use_prereqs: bool,
}

pub struct TemplateGenerator {
    units: UnitMap,
    templates: HashMap<String, QuestionTemplate>,
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{(\w+)\}").expect("placeholder pattern is a valid regex"))
}

impl TemplateGenerator {
    /// Load a unit map and a template list from JSON files.
    pub fn from_files(unit_map: &Path, templates: &Path) -> Result<Self, TemplateError> {
        let units: UnitMap = serde_json::from_str(&std::fs::read_to_string(unit_map)?)?;
        let templates: Vec<QuestionTemplate> =
            serde_json::from_str(&std::fs::read_to_string(templates)?)?;
        Ok(Self::from_parts(units, templates))
    }

    pub fn from_parts(mut units: UnitMap, templates: Vec<QuestionTemplate>) -> Self {
        for (id, unit) in units.units.iter_mut() {
            if unit.id.is_empty() {
                unit.id = id.clone();
            }
        }
        let templates = templates.into_iter().map(|t| (t.id.clone(), t)).collect();
        Self { units, templates }
    }

    pub fn units(&self) -> &UnitMap {
        &self.units
    }

    /// Japanese title of a unit, or the id itself when unknown.
    pub fn unit_title<'a>(&'a self, unit_id: &'a str) -> &'a str {
        self.units
            .units
            .get(unit_id)
            .map(|u| u.title_ja.as_str())
            .unwrap_or(unit_id)
    }

    /// Prerequisites of `unit_id`, breadth first, up to two levels deep.
    pub fn prerequisites(&self, unit_id: &str) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([(unit_id.to_string(), 0usize)]);
        let mut found = Vec::new();

        while let Some((id, depth)) = queue.pop_front() {
            if depth >= PREREQ_DEPTH {
                continue;
            }
            let Some(unit) = self.units.units.get(&id) else {
                continue;
            };
            for pid in &unit.prerequisites {
                if visited.insert(pid.clone()) {
                    found.push(pid.clone());
                    queue.push_back((pid.clone(), depth + 1));
                }
            }
        }
        found
    }

    pub fn generate_batch<R: Rng + ?Sized>(
        &self,
        config: &BatchConfig,
        rng: &mut R,
    ) -> Result<Vec<TemplateQuestion>, TemplateError> {
        if config.unit_ids.is_empty() || config.difficulties.is_empty() || config.count == 0 {
            return Ok(Vec::new());
        }
        for uid in &config.unit_ids {
            if !self.units.units.contains_key(uid) {
                return Err(TemplateError::UnknownUnit(uid.clone()));
            }
        }

        let mut prereqs: Vec<String> = Vec::new();
        if config.use_prereqs {
            for uid in &config.unit_ids {
                for p in self.prerequisites(uid) {
                    if !prereqs.contains(&p) {
                        prereqs.push(p);
                    }
                }
            }
        }

        let main_count = if prereqs.is_empty() {
            config.count
        } else {
            config.count * 7 / 10
        };
        let prereq_count = config.count - main_count;

        let mut questions = Vec::with_capacity(config.count.min(64));
        for _ in 0..main_count {
            let uid = &config.unit_ids[rng.gen_range(0..config.unit_ids.len())];
            let difficulty = config.difficulties[rng.gen_range(0..config.difficulties.len())];
            if let Some(q) = self.pick(uid, difficulty, rng)? {
                questions.push(q);
            }
        }
        for _ in 0..prereq_count {
            let uid = &prereqs[rng.gen_range(0..prereqs.len())];
            if let Some(q) = self.pick(uid, Difficulty::L1, rng)? {
                questions.push(q);
            }
        }
        Ok(questions)
    }

    /// A random template of `unit_id` at `difficulty`, instantiated. `None`
    /// when the unit has no template at that level.
    fn pick<R: Rng + ?Sized>(
        &self,
        unit_id: &str,
        difficulty: Difficulty,
        rng: &mut R,
    ) -> Result<Option<TemplateQuestion>, TemplateError> {
        let Some(unit) = self.units.units.get(unit_id) else {
            return Err(TemplateError::UnknownUnit(unit_id.to_string()));
        };
        let Some(ids) = unit.templates.get(&difficulty).filter(|ids| !ids.is_empty()) else {
            return Ok(None);
        };
        let template_id = &ids[rng.gen_range(0..ids.len())];
        let template = self
            .templates
            .get(template_id)
            .ok_or_else(|| TemplateError::UnknownTemplate(template_id.clone()))?;
        Ok(Some(self.instantiate(template, rng)))
    }

    fn instantiate<R: Rng + ?Sized>(&self, template: &QuestionTemplate, rng: &mut R) -> TemplateQuestion {
        let vars = TemplateVars::sample(rng);
        TemplateQuestion {
            id: format!("{:09x}", rng.gen_range(0..0x1_0000_0000_u64)),
            template_id: template.id.clone(),
            unit_id: template.unit_id.clone(),
            unit_title: self.unit_title(&template.unit_id).to_string(),
            difficulty: template.difficulty,
            stem_latex: vars.fill(&template.stem),
            answer_latex: vars.fill(&template.answer),
        }
    }
}

/// Values available to `${var}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateVars(BTreeMap<&'static str, i64>);

impl TemplateVars {
    pub fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let a = rng.gen_range(2..=9);
        let b = rng.gen_range(2..=9);
        let c = rng.gen_range(2..=9);
        let n = rng.gen_range(2..=5);
        let m = rng.gen_range(2..=5);
        Self::from_base(a, b, c, n, m)
    }

    pub fn from_base(a: i64, b: i64, c: i64, n: i64, m: i64) -> Self {
        Self(BTreeMap::from([
            ("a", a),
            ("b", b),
            ("c", c),
            ("n", n),
            ("m", m),
            ("sq", a * a),
            ("sum", a + b),
            ("prod", a * b),
            ("nm", n + m),
            ("nm_mul", n * m),
            ("ab", a * b),
            ("ans", a + b),
        ]))
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.0.get(name).copied()
    }

    /// Replace known placeholders; unknown ones are left verbatim.
    pub fn fill(&self, text: &str) -> String {
        placeholder_regex()
            .replace_all(text, |caps: &Captures| match self.get(&caps[1]) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }
}
