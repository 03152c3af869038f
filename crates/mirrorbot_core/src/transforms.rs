/*
 * SPDX-FileCopyrightText: 2026 Mirrorbot Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use mirrorbot_protocol::{Platform, PostView, SourcePost};
use regex::Regex;
use serde::{Deserialize, Serialize};

const URL_PATTERN: &str = r"https?://[^\s]+";

/// One pure string rewrite. Rules are applied in list order, global rules
/// before per-destination rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformRule {
    Prepend { text: String },
    Append { text: String },
    RegexReplace { pattern: String, replacement: String },
    StripUrls,
    AppendHashtags { tags: Vec<String> },
}

enum Compiled {
    Prepend(String),
    Append(String),
    RegexReplace(Regex, String),
    StripUrls(Regex),
    AppendHashtags(String),
}

pub struct CompiledRules(Vec<Compiled>);

/// Compiles a rule list. An invalid regex is a configuration error, caught
/// at load time rather than mid-pass.
pub fn compile(rules: &[TransformRule]) -> Result<CompiledRules> {
    let mut out = Vec::with_capacity(rules.len());
    for rule in rules {
        out.push(match rule {
            TransformRule::Prepend { text } => Compiled::Prepend(text.clone()),
            TransformRule::Append { text } => Compiled::Append(text.clone()),
            TransformRule::RegexReplace {
                pattern,
                replacement,
            } => {
                let re = Regex::new(pattern)
                    .with_context(|| format!("invalid transform regex: {pattern}"))?;
                Compiled::RegexReplace(re, replacement.clone())
            }
            TransformRule::StripUrls => {
                Compiled::StripUrls(Regex::new(URL_PATTERN).context("url pattern")?)
            }
            TransformRule::AppendHashtags { tags } => {
                let rendered = tags
                    .iter()
                    .map(|t| {
                        let t = t.trim().trim_start_matches('#');
                        format!("#{t}")
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                Compiled::AppendHashtags(rendered)
            }
        });
    }
    Ok(CompiledRules(out))
}

impl CompiledRules {
    pub fn apply(&self, text: &str) -> String {
        let mut out = text.to_string();
        for rule in &self.0 {
            out = match rule {
                Compiled::Prepend(t) => format!("{t}{out}"),
                Compiled::Append(t) => format!("{out}{t}"),
                Compiled::RegexReplace(re, replacement) => {
                    re.replace_all(&out, replacement.as_str()).into_owned()
                }
                Compiled::StripUrls(re) => {
                    let stripped = re.replace_all(&out, "").into_owned();
                    collapse_whitespace(&stripped)
                }
                Compiled::AppendHashtags(tags) => {
                    if tags.is_empty() {
                        out
                    } else if out.trim().is_empty() {
                        tags.clone()
                    } else {
                        format!("{out} {tags}")
                    }
                }
            };
        }
        out
    }
}

fn collapse_whitespace(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_space = false;
    for c in input.trim().chars() {
        if c == ' ' {
            if !last_space {
                out.push(c);
            }
            last_space = true;
        } else {
            last_space = c == '\n';
            out.push(c);
        }
    }
    out
}

/// Builds the per-destination view of a post: global rules first, then the
/// destination's own rules.
pub fn render_view(
    post: &SourcePost,
    platform: Platform,
    global: &CompiledRules,
    destination: Option<&CompiledRules>,
    backdate: bool,
) -> PostView {
    let mut text = global.apply(&post.text);
    if let Some(rules) = destination {
        text = rules.apply(&text);
    }
    PostView {
        post_id: post.id.clone(),
        platform,
        text,
        media: post.media.clone(),
        created_at_ms: post.created_at_ms,
        backdate,
    }
}
