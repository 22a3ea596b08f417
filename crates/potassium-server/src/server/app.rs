//! The demo application served by the binary.
//!
//! Each worker loads its own copy of a small lexicon-based sentiment model.
//! `/` scores a prompt, `/generate` streams per-token scores as NDJSON and
//! `/train` adjusts the worker's weights in the background.

use anyhow::{Context as _, bail};
use axum::http::{HeaderValue, StatusCode, header};
use bytes::Bytes;
use potassium::{Context, Potassium, Request, Response};
use serde_json::json;
use std::collections::HashMap;

const MODEL_KEY: &str = "model";
const LEARNING_RATE: f64 = 0.25;

const LEXICON: &[(&str, f64)] = &[
    ("good", 1.0),
    ("great", 1.5),
    ("excellent", 2.0),
    ("love", 1.5),
    ("fast", 0.5),
    ("bad", -1.0),
    ("terrible", -2.0),
    ("hate", -1.5),
    ("slow", -0.5),
    ("broken", -1.5),
];

/// Per-worker model state. Lives in the worker's [`Context`].
#[derive(Debug, Clone)]
pub struct SentimentModel {
    worker: usize,
    weights: HashMap<String, f64>,
}

impl SentimentModel {
    pub fn load(worker: usize) -> Self {
        let weights = LEXICON
            .iter()
            .map(|(word, weight)| ((*word).to_owned(), *weight))
            .collect();
        Self { worker, weights }
    }

    pub fn token_score(&self, token: &str) -> f64 {
        self.weights.get(token).copied().unwrap_or(0.0)
    }

    pub fn score(&self, text: &str) -> f64 {
        tokenize(text).map(|token| self.token_score(&token)).sum()
    }

    /// Nudges every token of `text` towards `target` (+1 or -1).
    pub fn train(&mut self, text: &str, target: f64) {
        for token in tokenize(text) {
            *self.weights.entry(token).or_default() += LEARNING_RATE * target;
        }
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

fn label(score: f64) -> &'static str {
    if score > 0.0 {
        "positive"
    } else if score < 0.0 {
        "negative"
    } else {
        "neutral"
    }
}

fn prompt(req: &Request) -> anyhow::Result<String> {
    req.json()
        .and_then(|body| body.get("prompt"))
        .and_then(|prompt| prompt.as_str())
        .map(str::to_owned)
        .context("expected a JSON body with a string `prompt`")
}

fn model(ctx: &mut Context) -> anyhow::Result<&mut SentimentModel> {
    ctx.get_mut::<SentimentModel>(MODEL_KEY)
        .context("worker context has no model")
}

fn classify(ctx: &mut Context, req: Request) -> anyhow::Result<Response> {
    let Ok(prompt) = prompt(&req) else {
        return Response::json(
            StatusCode::BAD_REQUEST,
            &json!({ "error": "expected a JSON body with a string `prompt`" }),
        );
    };
    let model = model(ctx)?;
    let score = model.score(&prompt);
    tracing::debug!(score, worker = model.worker, "classified");
    Response::json(
        StatusCode::OK,
        &json!({ "label": label(score), "score": score, "worker": model.worker }),
    )
}

fn generate(ctx: &mut Context, req: Request) -> anyhow::Result<Response> {
    let prompt = prompt(&req)?;
    let model = model(ctx)?.clone();
    let tokens: Vec<String> = tokenize(&prompt).collect();
    let lines = tokens.into_iter().map(move |token| {
        let line = json!({ "token": token, "score": model.token_score(&token) });
        let mut bytes = serde_json::to_vec(&line)?;
        bytes.push(b'\n');
        Ok::<_, anyhow::Error>(Bytes::from(bytes))
    });
    Ok(Response::stream(StatusCode::OK, lines).with_header(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson"),
    ))
}

fn train(ctx: &mut Context, req: Request) -> anyhow::Result<Response> {
    let body = req.json().context("expected a JSON body")?;
    let text = body
        .get("text")
        .and_then(|text| text.as_str())
        .context("missing `text`")?;
    let target = match body.get("label").and_then(|label| label.as_str()) {
        Some("positive") => 1.0,
        Some("negative") => -1.0,
        other => bail!("unknown label {other:?}"),
    };
    let model = model(ctx)?;
    model.train(text, target);
    tracing::info!(worker = model.worker, target, "trained");
    Ok(Response::new(StatusCode::OK))
}

/// Assembles the demo app.
pub fn build() -> potassium::Result<Potassium> {
    Potassium::new("sentiment")
        .init(|worker| Ok(Context::new().with(MODEL_KEY, SentimentModel::load(worker))))
        .handler("/", classify)?
        .handler("/generate", generate)?
        .background("/train", train)
}
