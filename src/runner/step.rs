//! Per-call input shapes and the mutable cursor threaded through a
//! `run_script` loop.

use std::collections::BTreeMap;

use crate::types::{Bid, UsageScene};

/// The raw `input` payload of one `run()` call, before normalisation.
#[derive(Clone, Debug, PartialEq)]
pub enum RunInput {
    Empty,
    Text(String),
    Values(BTreeMap<String, Vec<String>>),
}

impl Default for RunInput {
    fn default() -> Self {
        RunInput::Empty
    }
}

/// The normalised `{var: [values]}` shape the interaction handler and the
/// variable-extraction seam both consume.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NormalizedInput {
    pub values: BTreeMap<String, Vec<String>>,
}

impl NormalizedInput {
    pub fn single(key: impl Into<String>, values: Vec<String>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(key.into(), values);
        Self { values: map }
    }

    /// Joined-for-persistence form: each variable's values joined with
    /// `,`, and (for the rare multi-variable dict case) variables joined
    /// with `; ` — matching `generated_content`'s plain-string column.
    pub fn joined_all(&self) -> String {
        self.values.values().map(|vs| vs.join(",")).collect::<Vec<_>>().join("; ")
    }

    pub fn value_for(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|vs| vs.join(","))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Normalises a raw [`RunInput`] into `{var: [values]}`: a plain string
/// maps to `{declared_variable: [string]}`; a dict is kept with
/// `None`/empty values filtered; lists are preserved (joined only at
/// persistence time via [`NormalizedInput::joined_all`]).
pub fn normalize_input(input: &RunInput, declared_variable: Option<&str>) -> NormalizedInput {
    match input {
        RunInput::Empty => NormalizedInput::default(),
        RunInput::Text(text) => {
            let key = declared_variable.unwrap_or("_input").to_string();
            NormalizedInput::single(key, vec![text.clone()])
        }
        RunInput::Values(map) => {
            let values = map
                .iter()
                .filter_map(|(k, vs)| {
                    let filtered: Vec<String> = vs.iter().filter(|v| !v.trim().is_empty()).cloned().collect();
                    if filtered.is_empty() {
                        None
                    } else {
                        Some((k.clone(), filtered))
                    }
                })
                .collect();
            NormalizedInput { values }
        }
    }
}

/// The cursor carried across a `run_script` loop. `outline_item_bid`
/// mutates in place when a `_sys_next_chapter` click advances the
/// learner into a new leaf mid-script.
#[derive(Clone, Debug)]
pub struct StepState {
    pub user_bid: Bid,
    pub shifu_bid: Bid,
    pub outline_item_bid: Bid,
    pub preview_mode: bool,
    pub mobile: bool,
    pub paid: bool,
    pub usage_scene: UsageScene,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_maps_to_declared_variable() {
        let normalized = normalize_input(&RunInput::Text("rust".into()), Some("lang"));
        assert_eq!(normalized.value_for("lang").as_deref(), Some("rust"));
    }

    #[test]
    fn plain_text_falls_back_to_input_key_without_a_declared_variable() {
        let normalized = normalize_input(&RunInput::Text("hi".into()), None);
        assert_eq!(normalized.value_for("_input").as_deref(), Some("hi"));
    }

    #[test]
    fn dict_input_drops_empty_values() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), vec!["1".to_string(), "".to_string()]);
        map.insert("b".to_string(), vec!["".to_string()]);
        let normalized = normalize_input(&RunInput::Values(map), None);
        assert_eq!(normalized.value_for("a").as_deref(), Some("1"));
        assert_eq!(normalized.value_for("b"), None);
    }

    #[test]
    fn joined_all_comma_separates_multi_value_lists() {
        let normalized = NormalizedInput::single("tags", vec!["a".into(), "b".into()]);
        assert_eq!(normalized.joined_all(), "a,b");
    }
}
