//! DispatchStrategy 実装
//!
//! - DirectDispatch: category をそのまま delegate 名とみなす
//! - RoutedDispatch: `[routing]` テーブルで category -> delegate を解決

use std::collections::BTreeMap;

use crate::config::RouteConfig;
use crate::error::CoreError;
use crate::ports::DispatchStrategy;

#[derive(Debug, Default)]
pub struct DirectDispatch;

impl DirectDispatch {
    pub fn new() -> Self {
        Self
    }
}

impl DispatchStrategy for DirectDispatch {
    fn select_delegate(&self, category: &str) -> Result<String, CoreError> {
        Ok(category.to_string())
    }
}

/// Category routing from config. Categories without a route fall back to
/// `fallback` when one is set.
#[derive(Debug, Clone)]
pub struct RoutedDispatch {
    routes: BTreeMap<String, String>,
    fallback: Option<String>,
}

impl RoutedDispatch {
    pub fn new(routes: &BTreeMap<String, RouteConfig>) -> Self {
        Self {
            routes: routes
                .iter()
                .map(|(category, route)| (category.clone(), route.delegate.clone()))
                .collect(),
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, delegate: impl Into<String>) -> Self {
        self.fallback = Some(delegate.into());
        self
    }

    /// Every delegate name a route can resolve to.
    pub fn delegates(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .routes
            .values()
            .chain(self.fallback.iter())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

impl DispatchStrategy for RoutedDispatch {
    fn select_delegate(&self, category: &str) -> Result<String, CoreError> {
        self.routes
            .get(category)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| CoreError::InvalidSpec(format!("no route for category `{category}`")))
    }
}
