//! `CAFETAL_ANALYSIS_ENDPOINTS` parsing.

use anyhow::{Context, bail};

use cafetal_analysis::{Category, HttpAnalysisWork, WorkRegistry};

pub const ENDPOINTS_ENV: &str = "CAFETAL_ANALYSIS_ENDPOINTS";

/// Parse `category=url,category=url` pairs. Blank entries are skipped.
pub fn parse(raw: &str) -> anyhow::Result<Vec<(Category, String)>> {
    let mut pairs: Vec<(Category, String)> = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((name, url)) = entry.split_once('=') else {
            bail!("{ENDPOINTS_ENV}: expected category=url, got {entry:?}");
        };
        let category = Category::new(name.trim())
            .with_context(|| format!("{ENDPOINTS_ENV}: bad category in {entry:?}"))?;
        let url = url.trim();
        if url.is_empty() {
            bail!("{ENDPOINTS_ENV}: empty url for {category}");
        }
        if pairs.iter().any(|(c, _)| c == &category) {
            bail!("{ENDPOINTS_ENV}: {category} listed twice");
        }
        pairs.push((category, url.to_string()));
    }

    Ok(pairs)
}

pub fn registry(raw: &str) -> anyhow::Result<WorkRegistry> {
    let mut registry = WorkRegistry::new();
    for (category, url) in parse(raw)? {
        let work = HttpAnalysisWork::new(url)
            .with_context(|| format!("building http client for {category}"))?;
        registry.register(category, work);
    }
    Ok(registry)
}
