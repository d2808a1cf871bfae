//! Parametric sweep: one command template, distinct integers per node.
//!
//! A sweep is written `placeholder{begin[-end][,step]}`, e.g. `%i{0-9}`,
//! `x{5,-2}` or `n{-5--1}`. Each resolved node gets the next value of the
//! walk `begin, begin+step, ...`, wrapping back to `begin` once the walk
//! would pass `end`. Anything that does not match the grammar is taken as a
//! literal placeholder with no substitution.

use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sweep {
    pub placeholder: String,
    /// One value per node, or `None` when no valid range was given.
    pub values: Option<Vec<i64>>,
}

impl Sweep {
    /// Substitute the value for node `index` into `text`.
    pub fn apply(&self, text: &str, index: usize) -> String {
        match self.values.as_ref().and_then(|v| v.get(index)) {
            Some(value) => text.replace(&self.placeholder, &value.to_string()),
            None => text.to_string(),
        }
    }
}

fn range_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<placeholder>.+)\{(?P<begin>-?\d+)(?:-(?P<end>-?\d+))?(?:,(?P<step>[+-]?\d+))?\}$")
            .expect("sweep regex is valid")
    })
}

/// Parse `spec` and produce `count` values.
pub fn parse_sweep(spec: &str, count: usize) -> Sweep {
    let literal = || Sweep {
        placeholder: spec.to_string(),
        values: None,
    };

    let Some(caps) = range_regex().captures(spec) else {
        return literal();
    };
    let placeholder = caps["placeholder"].to_string();
    let Ok(begin) = caps["begin"].parse::<i64>() else {
        return literal();
    };
    let end = match caps.name("end").map(|m| m.as_str().parse::<i64>()) {
        Some(Ok(end)) => Some(end),
        Some(Err(_)) => return literal(),
        None => None,
    };
    let step = match caps.name("step").map(|m| m.as_str().parse::<i64>()) {
        Some(Ok(step)) => step,
        Some(Err(_)) => return literal(),
        None => match end {
            Some(end) if end < begin => -1,
            _ => 1,
        },
    };

    // A zero step never moves and a step pointing away from `end` never reaches it
    if step == 0 {
        return literal();
    }
    if let Some(end) = end {
        if (end > begin && step < 0) || (end < begin && step > 0) {
            return literal();
        }
    }

    let mut values = Vec::with_capacity(count);
    let mut current = begin;
    for _ in 0..count {
        values.push(current);
        current = match current.checked_add(step) {
            Some(next) if !passes(next, end, step) => next,
            _ => begin,
        };
    }

    Sweep {
        placeholder,
        values: Some(values),
    }
}

fn passes(value: i64, end: Option<i64>, step: i64) -> bool {
    match end {
        Some(end) if step > 0 => value > end,
        Some(end) => value < end,
        None => false,
    }
}
