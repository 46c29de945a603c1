pub mod sequence;

pub use sequence::StimulusSequence;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::ops::Range;
use std::path::Path;

/// Name of the parameter column holding presentation level.
pub const LEVEL_PARAMETER: &str = "level";

// DESCRIPTOR ------------------------------------------------------------------

/// Metadata of one stimulus parameter column. A parameter with `options` is
/// enumerated: its numeric value is the index of the chosen option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulusParameter {
    pub name: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl StimulusParameter {
    pub fn is_enumerated(&self) -> bool {
        !self.options.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulusDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub num_samples: usize,
    #[serde(default = "default_output_channels")]
    pub num_output_channels: usize,
    #[serde(default)]
    pub values: Vec<ParameterValue>,
}

fn default_output_channels() -> usize {
    1
}

/// External stimulus definition set, as stored in measurement templates and
/// the epoch index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StimulusSetDescriptor {
    #[serde(default)]
    pub parameters: Vec<StimulusParameter>,
    pub stimuli: Vec<StimulusDescriptor>,
}

impl StimulusSetDescriptor {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let yaml = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&yaml)?)
    }
}

// STIMULUS --------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Stimulus {
    pub id: String,
    pub name: String,
    /// One value per catalog parameter.
    pub values: Vec<f64>,
    /// Display strings parallel to `values`.
    pub strings: Vec<String>,
    pub num_samples: usize,
    pub num_output_channels: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddMode {
    /// Drop existing stimuli first.
    Replace,
    /// Keep existing stimuli; new ones get the following indices.
    Append,
}

// CATALOG ---------------------------------------------------------------------

/// Ordered, immutable stimulus list. Indices never change once assigned
/// except through [`AddMode::Replace`] or [`StimulusCatalog::clear`].
#[derive(Debug, Clone, Default)]
pub struct StimulusCatalog {
    parameters: Vec<StimulusParameter>,
    stimuli: Vec<Stimulus>,
}

impl StimulusCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds stimuli from `descriptor`. Returns the index range of the
    /// stimuli added.
    pub fn add(
        &mut self,
        descriptor: &StimulusSetDescriptor,
        max_stimulus_samples: usize,
        num_output_channels: usize,
        mode: AddMode,
    ) -> Result<Range<usize>> {
        let keep_existing = mode == AddMode::Append && !self.stimuli.is_empty();
        if keep_existing && descriptor.parameters != self.parameters {
            return Err(Error::Validation(
                "appended stimuli must use the existing parameter columns".into(),
            ));
        }

        let mut ids: HashSet<&str> = if keep_existing {
            self.stimuli.iter().map(|s| s.id.as_str()).collect()
        } else {
            HashSet::new()
        };
        let mut built = Vec::with_capacity(descriptor.stimuli.len());
        for stimulus in &descriptor.stimuli {
            if stimulus.num_samples > max_stimulus_samples {
                return Err(Error::Validation(format!(
                    "stimulus '{}' has {} samples, the epoch window allows {}",
                    stimulus.id, stimulus.num_samples, max_stimulus_samples
                )));
            }
            if stimulus.num_output_channels > num_output_channels {
                return Err(Error::Validation(format!(
                    "stimulus '{}' uses {} output channels, {} available",
                    stimulus.id, stimulus.num_output_channels, num_output_channels
                )));
            }
            if !ids.insert(stimulus.id.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate stimulus id '{}'",
                    stimulus.id
                )));
            }
            built.push(build_stimulus(&descriptor.parameters, stimulus)?);
        }

        if !keep_existing {
            self.stimuli.clear();
            self.parameters = descriptor.parameters.clone();
        }
        let first = self.stimuli.len();
        self.stimuli.extend(built);
        log::debug!(
            "Stimulus catalog: {} stimuli added ({} total)",
            self.stimuli.len() - first,
            self.stimuli.len()
        );
        Ok(first..self.stimuli.len())
    }

    /// Level variants of every stimulus in the catalog, one per entry of
    /// `levels` (in dB). Nothing is added.
    pub fn create_level_stimuli(&self, levels: &[f64]) -> Vec<Stimulus> {
        let column = self.level_column();
        let mut variants = Vec::with_capacity(self.stimuli.len() * levels.len());
        for &level in levels {
            for stimulus in &self.stimuli {
                let mut values = stimulus.values.clone();
                let mut strings = stimulus.strings.clone();
                match column {
                    Some(c) => {
                        values[c] = level;
                        strings[c] = format_value(level);
                    }
                    None => {
                        values.push(level);
                        strings.push(format_value(level));
                    }
                }
                variants.push(Stimulus {
                    id: format!("{}@{}dB", stimulus.id, format_value(level)),
                    name: format!("{} {} dB", stimulus.name, format_value(level)),
                    values,
                    strings,
                    num_samples: stimulus.num_samples,
                    num_output_channels: stimulus.num_output_channels,
                });
            }
        }
        variants
    }

    /// Appends level variants after the existing stimuli. A missing level
    /// column is added, with existing stimuli at 0 dB.
    pub fn add_level_stimuli(&mut self, levels: &[f64]) -> Result<Range<usize>> {
        let variants = self.create_level_stimuli(levels);
        let mut ids: HashSet<&str> = self.stimuli.iter().map(|s| s.id.as_str()).collect();
        for variant in &variants {
            if !ids.insert(variant.id.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate stimulus id '{}'",
                    variant.id
                )));
            }
        }

        if self.level_column().is_none() {
            self.parameters.push(StimulusParameter {
                name: LEVEL_PARAMETER.into(),
                unit: "dB".into(),
                options: Vec::new(),
            });
            for stimulus in self.stimuli.iter_mut() {
                stimulus.values.push(0.0);
                stimulus.strings.push(format_value(0.0));
            }
        }
        let first = self.stimuli.len();
        self.stimuli.extend(variants);
        Ok(first..self.stimuli.len())
    }

    fn level_column(&self) -> Option<usize> {
        self.parameter_index(LEVEL_PARAMETER)
    }

    pub fn index_from_name(&self, name: &str) -> Option<usize> {
        self.stimuli.iter().position(|s| s.name == name)
    }

    pub fn index_from_id(&self, id: &str) -> Option<usize> {
        self.stimuli.iter().position(|s| s.id == id)
    }

    pub fn parameter_index(&self, name: &str) -> Option<usize> {
        self.parameters.iter().position(|p| p.name == name)
    }

    pub fn parameter_value(&self, stimulus: usize, name: &str) -> Option<f64> {
        let column = self.parameter_index(name)?;
        self.stimuli.get(stimulus)?.values.get(column).copied()
    }

    pub fn parameter_string(&self, stimulus: usize, name: &str) -> Option<&str> {
        let column = self.parameter_index(name)?;
        self.stimuli
            .get(stimulus)?
            .strings
            .get(column)
            .map(|s| s.as_str())
    }

    pub fn parameters(&self) -> &[StimulusParameter] {
        &self.parameters
    }

    pub fn stimuli(&self) -> &[Stimulus] {
        &self.stimuli
    }

    pub fn get(&self, index: usize) -> Option<&Stimulus> {
        self.stimuli.get(index)
    }

    pub fn len(&self) -> usize {
        self.stimuli.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stimuli.is_empty()
    }

    pub fn clear(&mut self) {
        self.stimuli.clear();
        self.parameters.clear();
    }

    /// Descriptor that rebuilds this catalog through [`StimulusCatalog::add`].
    pub fn to_descriptor(&self) -> StimulusSetDescriptor {
        let stimuli = self
            .stimuli
            .iter()
            .map(|s| StimulusDescriptor {
                id: s.id.clone(),
                name: Some(s.name.clone()),
                num_samples: s.num_samples,
                num_output_channels: s.num_output_channels,
                values: self
                    .parameters
                    .iter()
                    .zip(s.values.iter().zip(&s.strings))
                    .map(|(p, (&v, text))| {
                        if p.is_enumerated() {
                            ParameterValue::Text(text.clone())
                        } else {
                            ParameterValue::Number(v)
                        }
                    })
                    .collect(),
            })
            .collect();
        StimulusSetDescriptor {
            parameters: self.parameters.clone(),
            stimuli,
        }
    }
}

fn build_stimulus(
    parameters: &[StimulusParameter],
    descriptor: &StimulusDescriptor,
) -> Result<Stimulus> {
    if descriptor.values.len() != parameters.len() {
        return Err(Error::Validation(format!(
            "stimulus '{}' has {} parameter values, expected {}",
            descriptor.id,
            descriptor.values.len(),
            parameters.len()
        )));
    }

    let mut values = Vec::with_capacity(parameters.len());
    let mut strings = Vec::with_capacity(parameters.len());
    for (parameter, value) in parameters.iter().zip(&descriptor.values) {
        match (parameter.is_enumerated(), value) {
            (false, ParameterValue::Number(v)) => {
                values.push(*v);
                strings.push(format_value(*v));
            }
            (true, ParameterValue::Text(text)) => {
                let option = parameter
                    .options
                    .iter()
                    .position(|o| o == text)
                    .ok_or_else(|| {
                        Error::Validation(format!(
                            "'{}' is not an option of parameter '{}'",
                            text, parameter.name
                        ))
                    })?;
                values.push(option as f64);
                strings.push(text.clone());
            }
            _ => {
                return Err(Error::Validation(format!(
                    "stimulus '{}': wrong value type for parameter '{}'",
                    descriptor.id, parameter.name
                )))
            }
        }
    }

    Ok(Stimulus {
        id: descriptor.id.clone(),
        name: descriptor
            .name
            .clone()
            .unwrap_or_else(|| descriptor.id.clone()),
        values,
        strings,
        num_samples: descriptor.num_samples,
        num_output_channels: descriptor.num_output_channels,
    })
}

fn format_value(value: f64) -> String {
    format!("{}", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(ids: &[&str], num_samples: usize) -> StimulusSetDescriptor {
        StimulusSetDescriptor {
            parameters: vec![
                StimulusParameter {
                    name: "frequency".into(),
                    unit: "Hz".into(),
                    options: Vec::new(),
                },
                StimulusParameter {
                    name: "ear".into(),
                    unit: String::new(),
                    options: vec!["left".into(), "right".into()],
                },
            ],
            stimuli: ids
                .iter()
                .enumerate()
                .map(|(i, id)| StimulusDescriptor {
                    id: id.to_string(),
                    name: None,
                    num_samples,
                    num_output_channels: 1,
                    values: vec![
                        ParameterValue::Number(1000.0 * (i + 1) as f64),
                        ParameterValue::Text(if i % 2 == 0 { "left" } else { "right" }.into()),
                    ],
                })
                .collect(),
        }
    }

    #[test]
    fn parses_descriptor_yaml() {
        let yaml = r#"
parameters:
  - name: frequency
    unit: Hz
  - name: ear
    options: [left, right]
stimuli:
  - id: tone1
    num_samples: 400
    values: [1000.0, right]
"#;
        let descriptor: StimulusSetDescriptor = serde_yaml::from_str(yaml).unwrap();
        let mut catalog = StimulusCatalog::new();
        catalog.add(&descriptor, 1000, 2, AddMode::Replace).unwrap();
        assert_eq!(catalog.get(0).unwrap().name, "tone1");
        assert_eq!(catalog.parameter_value(0, "ear"), Some(1.0));
        assert_eq!(catalog.parameter_string(0, "ear"), Some("right"));
        assert_eq!(catalog.parameter_value(0, "frequency"), Some(1000.0));
    }

    #[test]
    fn rejects_stimuli_longer_than_the_epoch() {
        let mut catalog = StimulusCatalog::new();
        let result = catalog.add(&descriptor(&["a", "b"], 2000), 1000, 1, AddMode::Replace);
        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(catalog.is_empty());
    }

    #[test]
    fn rejects_duplicate_ids_and_unknown_options() {
        let mut catalog = StimulusCatalog::new();
        assert!(catalog.add(&descriptor(&["a", "a"], 10), 100, 1, AddMode::Replace).is_err());

        let mut bad = descriptor(&["a"], 10);
        bad.stimuli[0].values[1] = ParameterValue::Text("both".into());
        assert!(matches!(
            catalog.add(&bad, 100, 1, AddMode::Replace),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn append_keeps_existing_indices() {
        let mut catalog = StimulusCatalog::new();
        catalog.add(&descriptor(&["a", "b"], 10), 100, 1, AddMode::Replace).unwrap();
        let added = catalog.add(&descriptor(&["c"], 10), 100, 1, AddMode::Append).unwrap();
        assert_eq!(added, 2..3);
        assert_eq!(catalog.index_from_id("a"), Some(0));
        assert_eq!(catalog.index_from_id("c"), Some(2));
        assert_eq!(catalog.index_from_name("b"), Some(1));
        assert_eq!(catalog.index_from_id("zzz"), None);

        assert!(catalog.add(&descriptor(&["a"], 10), 100, 1, AddMode::Append).is_err());
        let replaced = catalog.add(&descriptor(&["x"], 10), 100, 1, AddMode::Replace).unwrap();
        assert_eq!(replaced, 0..1);
    }

    #[test]
    fn level_stimuli_are_appended() {
        let mut catalog = StimulusCatalog::new();
        catalog.add(&descriptor(&["a", "b"], 10), 100, 1, AddMode::Replace).unwrap();
        assert_eq!(catalog.create_level_stimuli(&[40.0, 60.0]).len(), 4);
        assert_eq!(catalog.len(), 2);

        let added = catalog.add_level_stimuli(&[40.0, 60.0]).unwrap();
        assert_eq!(added, 2..6);
        assert_eq!(catalog.parameter_value(0, LEVEL_PARAMETER), Some(0.0));
        assert_eq!(catalog.parameter_value(5, LEVEL_PARAMETER), Some(60.0));
        assert_eq!(catalog.index_from_id("b@40dB"), Some(3));

        // Second round replaces the level value instead of adding a column
        let added = catalog.add_level_stimuli(&[80.0]).unwrap();
        assert_eq!(added.len(), 6);
        assert_eq!(catalog.parameters().len(), 3);
        assert!(catalog.add_level_stimuli(&[80.0]).is_err());
    }

    #[test]
    fn descriptor_round_trip() {
        let mut catalog = StimulusCatalog::new();
        catalog.add(&descriptor(&["a", "b"], 10), 100, 1, AddMode::Replace).unwrap();
        let mut rebuilt = StimulusCatalog::new();
        rebuilt.add(&catalog.to_descriptor(), 100, 1, AddMode::Replace).unwrap();
        assert_eq!(rebuilt.stimuli(), catalog.stimuli());
    }
}
