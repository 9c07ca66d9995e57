//! steam-review-corpus
//! -------------------
//! Standalone Rust tool that builds an annotated corpus of Steam game reviews
//! for six systems-heavy games (three co-op / single-player pairs) using
//! OpenAI with **Structured Outputs (JSON Schema)**.
//!
//! Pipeline:
//!   data/review_<appid>.json (or Steam appreviews API) -> filter + normalize
//!   -> corpus.json -> batch -> call LLM -> strict JSON labels
//!   -> annotated_corpus.json
//!
//! Major design goals:
//!  - REPRODUCIBLE: given the same raw snapshot, re-running the extractor
//!    produces a byte-identical corpus checkpoint
//!  - TOLERANT: malformed raw records and unparsable model output degrade to
//!    skips and sentinels, never to a crashed run
//!  - RESUMABLE-ISH: the annotated corpus is rewritten after every batch, so
//!    a late model failure keeps everything annotated so far
//!
//! Console logging: verbose so you can follow step-by-step.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::fs::{create_dir_all, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

// ================================
// CLI + Config
// ================================

#[derive(Debug, Parser)]
#[command(name="steam-review-corpus", version, about="Build an LLM-annotated corpus of Steam reviews")]
struct Cli {
    /// Directory holding cached raw review files (review_<appid>.json)
    #[arg(long, value_name="DIR", default_value="./data")]
    data_dir: PathBuf,

    /// Output directory (corpus.json, annotated_corpus.json)
    #[arg(long, value_name="DIR", default_value="./out")]
    out_dir: PathBuf,

    /// OpenAI model ID used for annotation
    #[arg(long, default_value="gpt-5-mini")]
    model: String,

    /// Reviews per model call
    #[arg(long, default_value_t=8)]
    batch_size: usize,

    /// Max attempts per model call
    #[arg(long, default_value_t=3)]
    max_retries: usize,

    /// Keep only the N most helpful reviews per game
    #[arg(long, value_name="N")]
    review_limit: Option<usize>,

    /// Overall HTTP request timeout in seconds (default: 120)
    #[arg(long)]
    timeout_seconds: Option<u64>,

    /// Comma-separated game slugs to process (e.g., "factorio,portal_2")
    #[arg(long, value_name="CSV")]
    games: Option<String>,

    /// Run against a small embedded sample instead of real data (offline)
    #[arg(long, default_value_t = false)]
    demo: bool,

    /// Stop after writing the extractor checkpoint
    #[arg(long, default_value_t = false)]
    skip_annotation: bool,
}

#[derive(Debug, Clone)]
struct Config {
    data_dir: PathBuf,
    out_dir: PathBuf,
    model: String,
    batch_size: usize,
    max_retries: usize,
    review_limit: Option<usize>,
    timeout_seconds: u64,
    demo: bool,
}

// ================================
// Game corpus (fixed)
// ================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GameMode {
    Coop,
    SinglePlayer,
}

impl GameMode {
    fn as_str(self) -> &'static str {
        match self {
            GameMode::Coop => "co-op",
            GameMode::SinglePlayer => "single-player",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Game {
    game_id: &'static str,
    name: &'static str,
    app_id: u32,
    mode: GameMode,
}

/// Three pairs of systems-heavy games, each pair one co-op and one
/// single-player title. Corpus order is fixed by this table.
const GAME_CORPUS: &[Game] = &[
    Game { game_id: "factorio", name: "Factorio", app_id: 427_520, mode: GameMode::Coop },
    Game { game_id: "dyson_sphere_program", name: "Dyson Sphere Program", app_id: 1_366_540, mode: GameMode::SinglePlayer },
    Game { game_id: "dont_starve_together", name: "Don't Starve Together", app_id: 322_330, mode: GameMode::Coop },
    Game { game_id: "subnautica", name: "Subnautica", app_id: 264_710, mode: GameMode::SinglePlayer },
    Game { game_id: "portal_2", name: "Portal 2", app_id: 620, mode: GameMode::Coop },
    Game { game_id: "the_talos_principle", name: "The Talos Principle", app_id: 257_510, mode: GameMode::SinglePlayer },
];

const DEMO_GAME: Game = Game {
    game_id: "demo_coop_game",
    name: "Demo Co-op Game",
    app_id: 0,
    mode: GameMode::Coop,
};

// ================================
// Data model
// ================================

/// Reviews shorter than this are treated as noise and skipped.
const MIN_REVIEW_CHARS: usize = 10;

/// One normalized English-language review, immutable after extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Review {
    id: String,
    game_id: String,
    text: String,
    recommended: bool,
    playtime_hours: f64,
    language: String,
    timestamp: i64,
}

/// The label set the model assigns to one review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
struct ReviewLabels {
    /// Does the reviewer describe themselves learning something?
    perceived_learning: bool,
    /// Is the experience framed as shared (we/us/friend/teammate)?
    shared_context: bool,
    language_category: LanguageCategory,
}

/// How the reviewer talks about the game's systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
enum LanguageCategory {
    Perception,
    Epistemic,
    Mixed,
    None,
}

/// Sentinel written when a review's labels could not be parsed from the
/// model output.
const UNPARSED_SENTINEL: &str = "unparsed";

/// Either a fully populated label set or the unparsed sentinel, never a
/// partial mix. Serializes untagged: an object for labels, a bare string
/// for the sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
enum LabelSet {
    Parsed(ReviewLabels),
    Sentinel(String),
}

impl LabelSet {
    fn unparsed() -> Self {
        LabelSet::Sentinel(UNPARSED_SENTINEL.to_string())
    }

    fn is_parsed(&self) -> bool {
        matches!(self, LabelSet::Parsed(_))
    }
}

/// Terminal entity: a Review plus its labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AnnotatedReview {
    #[serde(flatten)]
    review: Review,
    labels: LabelSet,
}

// ================================
// Error taxonomy
// ================================

/// Fatal pipeline failures. The recoverable cases (malformed raw record,
/// unparsable model output) are handled in place with a skip or a sentinel.
#[derive(Debug, Error)]
enum PipelineError {
    #[error("review fetch failed for app {app_id}: {reason}")]
    Fetch { app_id: u32, reason: String },
    #[error("model call failed after {attempts} attempt(s): {reason}")]
    ModelCall { attempts: usize, reason: String },
}

// ================================
// Raw Steam shapes
// ================================

/// Cached raw file layout (`data/review_<appid>.json`): reviews keyed by
/// recommendation id, as written by the original collection tooling.
#[derive(Debug, Deserialize)]
struct RawReviewFile {
    reviews: HashMap<String, serde_json::Value>,
}

/// One page from the Steam `appreviews` endpoint.
#[derive(Debug, Deserialize)]
struct ReviewPage {
    success: i64,
    #[serde(default)]
    reviews: Vec<serde_json::Value>,
    #[serde(default)]
    cursor: Option<String>,
}

/// Lenient view of one raw review record. Every field is optional so a
/// single bad record deserializes (and is then rejected in normalization)
/// instead of poisoning the whole file.
#[derive(Debug, Clone, Deserialize)]
struct RawReview {
    #[serde(default)]
    recommendationid: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    review: Option<String>,
    #[serde(default)]
    timestamp_created: Option<i64>,
    #[serde(default)]
    voted_up: Option<bool>,
    #[serde(default)]
    votes_up: u64,
    #[serde(default)]
    author: RawAuthor,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawAuthor {
    /// Minutes on record at the time the review was written.
    #[serde(default)]
    playtime_at_review: Option<f64>,
    #[serde(default)]
    playtime_forever: Option<f64>,
}

// ================================
// Extractor: fetch / load raw reviews
// ================================

/// Page through the public Steam appreviews endpoint for one game.
/// Any HTTP or API-level failure is fatal for the run.
async fn fetch_game_reviews(
    client: &Client,
    cfg: &Config,
    game: &Game,
) -> Result<Vec<serde_json::Value>, PipelineError> {
    let url = format!("https://store.steampowered.com/appreviews/{}", game.app_id);
    let fetch_err = |reason: String| PipelineError::Fetch { app_id: game.app_id, reason };

    let mut collected: Vec<serde_json::Value> = Vec::new();
    let mut cursor = String::from("*");
    let mut seen_cursors: HashSet<String> = HashSet::new();

    loop {
        info!("➡️ [Steam] Requesting page for {} (cursor={})", game.name, cursor);
        let resp = client
            .get(&url)
            .query(&[
                ("json", "1"),
                ("language", "english"),
                ("filter", "recent"),
                ("review_type", "all"),
                ("purchase_type", "all"),
                ("num_per_page", "100"),
                ("cursor", cursor.as_str()),
            ])
            .send()
            .await
            .map_err(|e| fetch_err(format!("HTTP error: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(fetch_err(format!("non-success status {status}")));
        }
        let page: ReviewPage = resp
            .json()
            .await
            .map_err(|e| fetch_err(format!("response decode: {e}")))?;
        if page.success != 1 {
            return Err(fetch_err(format!("API reported success={}", page.success)));
        }
        if page.reviews.is_empty() {
            break;
        }
        collected.extend(page.reviews);
        info!("✅ [Steam] {} raw reviews so far for {}", collected.len(), game.name);

        if let Some(limit) = cfg.review_limit {
            if collected.len() >= limit {
                break;
            }
        }
        // Steam signals the end by repeating a cursor.
        let Some(next) = page.cursor else { break };
        if !seen_cursors.insert(next.clone()) {
            break;
        }
        cursor = next;

        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    Ok(collected)
}

/// Persist fetched raw reviews in the same keyed layout the local cache
/// files use, so the next run takes the offline path.
fn write_review_cache(path: &Path, raw: &[serde_json::Value]) -> Result<()> {
    let mut map = serde_json::Map::new();
    for r in raw {
        if let Some(id) = r.get("recommendationid").and_then(|v| v.as_str()) {
            map.insert(id.to_string(), r.clone());
        }
    }
    let file_value = json!({ "reviews": map });
    let mut f = File::create(path).context("Failed to create review cache file")?;
    f.write_all(serde_json::to_string_pretty(&file_value)?.as_bytes())?;
    info!("💾 Cached {} raw reviews to {}", map.len(), path.display());
    Ok(())
}

/// Raw reviews for one game: local cache if present and readable, Steam
/// fetch otherwise (which then refreshes the cache).
async fn load_or_fetch_raw(
    client: &Client,
    cfg: &Config,
    game: &Game,
) -> Result<Vec<serde_json::Value>> {
    if cfg.demo {
        info!("📄 Using embedded sample reviews for {}", game.name);
        let file: RawReviewFile = serde_json::from_str(include_str!("../demos/sample_reviews.json"))
            .context("Embedded sample reviews are invalid JSON")?;
        return Ok(file.reviews.into_values().collect());
    }

    let cache_path = cfg.data_dir.join(format!("review_{}.json", game.app_id));
    if cache_path.exists() {
        match std::fs::read_to_string(&cache_path)
            .map_err(anyhow::Error::from)
            .and_then(|s| serde_json::from_str::<RawReviewFile>(&s).map_err(anyhow::Error::from))
        {
            Ok(file) => {
                info!("📄 Loaded local cache {} ({} raw reviews)", cache_path.display(), file.reviews.len());
                return Ok(file.reviews.into_values().collect());
            }
            Err(e) => {
                warn!("⚠️ Cache {} unreadable ({e}), refetching from Steam", cache_path.display());
            }
        }
    } else {
        info!("📄 No local cache for {}, fetching from Steam", game.name);
    }

    let raw = fetch_game_reviews(client, cfg, game).await?;
    create_dir_all(&cfg.data_dir).context("Failed to create data dir")?;
    write_review_cache(&cache_path, &raw)?;
    Ok(raw)
}

// ================================
// Extractor: normalize + filter
// ================================

/// Normalize one raw record. Returns None both for the expected case
/// (non-English review) and for malformed records; only the latter warns.
fn normalize_raw(game_id: &str, raw: &RawReview) -> Option<Review> {
    let language = raw.language.as_deref()?.to_string();
    if language != "english" {
        debug!("dropping non-english review (language={language})");
        return None;
    }
    let Some(id) = raw.recommendationid.clone() else {
        warn!("⚠️ Skipping malformed record for {game_id}: missing recommendationid");
        return None;
    };
    let text = raw.review.clone().unwrap_or_default();
    if text.trim().chars().count() < MIN_REVIEW_CHARS {
        warn!("⚠️ Skipping review {id} for {game_id}: text too short");
        return None;
    }
    let minutes = raw
        .author
        .playtime_at_review
        .or(raw.author.playtime_forever)
        .unwrap_or(0.0);

    Some(Review {
        id,
        game_id: game_id.to_string(),
        text,
        recommended: raw.voted_up.unwrap_or(false),
        playtime_hours: minutes / 60.0,
        language,
        timestamp: raw.timestamp_created.unwrap_or(0),
    })
}

/// Turn one game's raw records into normalized reviews, most helpful first
/// (votes_up descending, id ascending as the deterministic tie-break).
fn normalize_game_reviews(
    game_id: &str,
    raw: Vec<serde_json::Value>,
    limit: Option<usize>,
) -> Vec<Review> {
    let mut parsed: Vec<RawReview> = raw
        .iter()
        .filter_map(|v| match serde_json::from_value::<RawReview>(v.clone()) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!("⚠️ Skipping malformed record for {game_id}: {e}");
                None
            }
        })
        .collect();

    parsed.sort_by_key(|r| {
        (
            Reverse(r.votes_up),
            r.recommendationid.clone().unwrap_or_default(),
        )
    });

    let mut reviews: Vec<Review> = parsed
        .iter()
        .filter_map(|r| normalize_raw(game_id, r))
        .collect();
    if let Some(limit) = limit {
        reviews.truncate(limit);
    }
    reviews
}

/// Run the full extraction stage: every game in corpus order, concatenated.
async fn build_corpus(client: &Client, cfg: &Config, games: &[Game]) -> Result<Vec<Review>> {
    let mut corpus = Vec::new();
    for game in games {
        info!("🎮 Processing {} ({})", game.name, game.mode.as_str());
        let raw = load_or_fetch_raw(client, cfg, game).await?;
        let raw_count = raw.len();
        let reviews = normalize_game_reviews(game.game_id, raw, cfg.review_limit);
        info!("  - Kept {} of {} raw reviews", reviews.len(), raw_count);
        corpus.extend(reviews);
    }
    Ok(corpus)
}

// ================================
// Annotator: prompts + schema
// ================================

const SYSTEM_PROMPT: &str = "You are a precise review annotation engine. \
    You ONLY return JSON that matches the provided JSON Schema. \
    Annotate each numbered review independently and carry its 0-based index \
    back as review_index. Never skip a review and never invent extra ones.";

const ANNOTATION_INSTRUCTION: &str = include_str!("../prompts/annotation.txt");

/// What we ask the model to return for one review of a batch.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
struct ReviewAnnotation {
    /// 0-based position of the review in the submitted batch.
    review_index: u32,
    perceived_learning: bool,
    shared_context: bool,
    language_category: LanguageCategory,
}

/// The full structured output for one batch.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
struct BatchAnnotation {
    annotations: Vec<ReviewAnnotation>,
}

/// Strict JSON Schema for BatchAnnotation, derived from the Rust types and
/// sanitized for the Responses API strict mode (no additionalProperties,
/// no `format` keywords, everything inlined).
fn batch_annotation_schema() -> Result<serde_json::Value> {
    let mut settings = schemars::gen::SchemaSettings::draft07();
    settings.inline_subschemas = true;
    let generator = settings.into_generator();
    let schema = generator.into_root_schema_for::<BatchAnnotation>();
    let mut value = serde_json::to_value(schema).context("schema to JSON")?;
    if let Some(map) = value.as_object_mut() {
        map.remove("$schema");
    }
    sanitize_schema(&mut value);
    Ok(value)
}

/// Recursively add `additionalProperties: false` to object schemas and drop
/// keywords the strict structured-output validator rejects.
fn sanitize_schema(schema: &mut serde_json::Value) {
    use serde_json::Value;
    match schema {
        Value::Object(map) => {
            map.remove("format");
            let is_object_type = map
                .get("type")
                .and_then(|t| t.as_str())
                .map(|t| t == "object")
                .unwrap_or(false)
                || map.contains_key("properties");
            if is_object_type && !map.contains_key("additionalProperties") {
                map.insert("additionalProperties".to_string(), Value::Bool(false));
            }
            for (_k, v) in map.iter_mut() {
                sanitize_schema(v);
            }
        }
        Value::Array(arr) => {
            for v in arr.iter_mut() {
                sanitize_schema(v);
            }
        }
        _ => {}
    }
}

/// Render the fixed instruction plus the numbered batch of review texts.
fn render_batch_prompt(batch: &[Review]) -> String {
    let mut prompt = String::from(ANNOTATION_INSTRUCTION);
    prompt.push_str("\nREVIEWS:\n");
    for (i, review) in batch.iter().enumerate() {
        prompt.push_str(&format!("[{i}] {}\n\n", review.text));
    }
    prompt
}

// ================================
// Annotator: model client
// ================================

/// Narrow seam around the external model: a prompt in, generated text out.
/// Keeps every bit of parsing/validation testable without the real model.
trait TextGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, PipelineError>;
}

struct OpenAiGenerator {
    client: Client,
    api_key: String,
    model: String,
    schema: serde_json::Value,
    max_retries: usize,
}

impl TextGenerator for OpenAiGenerator {
    /// Call the Responses API with strict structured outputs. Retries with
    /// exponential backoff; exhausting retries is fatal for the run.
    async fn generate(&self, prompt: &str) -> Result<String, PipelineError> {
        let url = "https://api.openai.com/v1/responses";

        let mut attempt = 0usize;
        let mut delay_ms = 750u64;
        let mut last_reason = String::new();

        while attempt < self.max_retries {
            attempt += 1;

            let body = json!({
                "model": self.model,
                "input": [
                  {
                    "role": "system",
                    "content": [{ "type": "input_text", "text": SYSTEM_PROMPT }]
                  },
                  {
                    "role": "user",
                    "content": [{ "type": "input_text", "text": prompt }]
                  }
                ],
                "text": {
                  "format": {
                    "type": "json_schema",
                    "name": "review_annotation_schema",
                    "schema": self.schema,
                    "strict": true
                  }
                }
            });

            let started = Instant::now();
            info!("➡️ [OpenAI] Sending batch (attempt {attempt})");
            let sent = self
                .client
                .post(url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            let resp = match sent {
                Ok(r) => r,
                Err(e) => {
                    last_reason = format!("HTTP error: {e}");
                    warn!("⚠️ [OpenAI] {last_reason} on attempt {attempt}");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = (delay_ms as f64 * 1.75).min(5000.0) as u64;
                    continue;
                }
            };

            let status = resp.status();
            let val: serde_json::Value = match resp.json().await {
                Ok(v) => v,
                Err(e) => {
                    last_reason = format!("response decode: {e}");
                    warn!("⚠️ [OpenAI] {last_reason} on attempt {attempt}");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = (delay_ms as f64 * 1.75).min(5000.0) as u64;
                    continue;
                }
            };

            if status.is_success() {
                if let Some(text) = extract_output_text(&val) {
                    info!("✅ [OpenAI] Received output ({}ms)", started.elapsed().as_millis());
                    return Ok(text);
                }
                last_reason = "no output_text in response payload".to_string();
            } else {
                last_reason = format!("non-success status {status}: {val}");
            }
            warn!("⚠️ [OpenAI] {last_reason} on attempt {attempt}");

            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            delay_ms = (delay_ms as f64 * 1.75).min(5000.0) as u64;
        }

        Err(PipelineError::ModelCall { attempts: attempt, reason: last_reason })
    }
}

/// Pull the generated text out of a Responses API payload. The SDK has
/// shipped a few shapes: `output[].content[].text` messages and a
/// top-level `output_text` convenience field.
fn extract_output_text(val: &serde_json::Value) -> Option<String> {
    if let Some(items) = val.get("output").and_then(|o| o.as_array()) {
        for item in items {
            let Some(contents) = item.get("content").and_then(|c| c.as_array()) else {
                continue;
            };
            for c in contents {
                if c.get("type").and_then(|t| t.as_str()) == Some("output_text") {
                    if let Some(text) = c.get("text").and_then(|t| t.as_str()) {
                        return Some(text.to_string());
                    }
                }
            }
        }
    }
    val.get("output_text")
        .and_then(|t| t.as_str())
        .map(|t| t.to_string())
}

// ================================
// Annotator: response parsing + merge
// ================================

/// Parse one batch's generated text into exactly `batch_len` label sets.
/// Every review whose annotation is missing, duplicated, out of range, or
/// invalid gets the unparsed sentinel; the batch itself never fails.
fn parse_batch_labels(text: &str, batch_len: usize) -> Vec<LabelSet> {
    let mut out = vec![LabelSet::unparsed(); batch_len];

    let payload: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("⚠️ Batch output is not valid JSON ({e}), marking all {batch_len} reviews unparsed");
            return out;
        }
    };

    // Accept both the full schema and a bare annotation array.
    let entries = payload
        .get("annotations")
        .and_then(|v| v.as_array())
        .cloned()
        .or_else(|| payload.as_array().cloned())
        .unwrap_or_default();

    let mut seen = vec![false; batch_len];
    for entry in entries {
        let annotation: ReviewAnnotation = match serde_json::from_value(entry) {
            Ok(a) => a,
            Err(e) => {
                warn!("⚠️ Dropping invalid annotation entry: {e}");
                continue;
            }
        };
        let idx = annotation.review_index as usize;
        if idx >= batch_len {
            warn!("⚠️ Dropping annotation with out-of-range index {idx}");
            continue;
        }
        if seen[idx] {
            warn!("⚠️ Dropping duplicate annotation for index {idx}");
            continue;
        }
        seen[idx] = true;
        out[idx] = LabelSet::Parsed(ReviewLabels {
            perceived_learning: annotation.perceived_learning,
            shared_context: annotation.shared_context,
            language_category: annotation.language_category,
        });
    }

    let missing = seen.iter().filter(|s| !**s).count();
    if missing > 0 {
        warn!("⚠️ {missing} of {batch_len} reviews in batch left unparsed");
    }
    out
}

/// Run the annotation stage: sequential batches in corpus order. `on_batch`
/// is called with everything annotated so far after each batch, which is
/// how partial progress reaches disk before a later failure.
async fn annotate_corpus<G, F>(
    generator: &G,
    corpus: &[Review],
    batch_size: usize,
    mut on_batch: F,
) -> Result<Vec<AnnotatedReview>>
where
    G: TextGenerator,
    F: FnMut(&[AnnotatedReview]) -> Result<()>,
{
    let mut annotated: Vec<AnnotatedReview> = Vec::with_capacity(corpus.len());
    for (i, batch) in corpus.chunks(batch_size).enumerate() {
        debug!("annotating batch {i} ({} reviews)", batch.len());
        let prompt = render_batch_prompt(batch);
        let text = generator.generate(&prompt).await?;
        let labels = parse_batch_labels(&text, batch.len());
        for (review, label_set) in batch.iter().zip(labels) {
            annotated.push(AnnotatedReview { review: review.clone(), labels: label_set });
        }
        on_batch(&annotated)?;
    }
    Ok(annotated)
}

// ================================
// JSON output
// ================================

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut f = File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    f.write_all(serde_json::to_string_pretty(value)?.as_bytes())?;
    f.write_all(b"\n")?;
    Ok(())
}

// ================================
// Main
// ================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // ---- Logging setup ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let cfg = Config {
        data_dir: cli.data_dir,
        out_dir: cli.out_dir,
        model: cli.model,
        batch_size: cli.batch_size.max(1),
        max_retries: cli.max_retries.max(1),
        review_limit: cli.review_limit,
        timeout_seconds: cli.timeout_seconds.unwrap_or(120),
        demo: cli.demo,
    };

    // ---- Select games ----
    let games: Vec<Game> = if cfg.demo {
        vec![DEMO_GAME]
    } else if let Some(csv) = &cli.games {
        let wanted: HashSet<&str> = csv.split(',').map(str::trim).collect();
        let selected: Vec<Game> = GAME_CORPUS
            .iter()
            .copied()
            .filter(|g| wanted.contains(g.game_id))
            .collect();
        if selected.is_empty() {
            anyhow::bail!("--games matched no known game slugs: {csv}");
        }
        selected
    } else {
        GAME_CORPUS.to_vec()
    };

    create_dir_all(&cfg.out_dir).context("Failed to create out-dir")?;
    let corpus_path = cfg.out_dir.join("corpus.json");
    let annotated_path = cfg.out_dir.join("annotated_corpus.json");

    info!("🧠 Model: {}", cfg.model);
    info!("⚙️  BatchSize={}, MaxRetries={}, Games={}", cfg.batch_size, cfg.max_retries, games.len());

    // ---- HTTP client ----
    let client = Client::builder()
        .gzip(true)
        .connect_timeout(Duration::from_secs(15))
        .timeout(Duration::from_secs(cfg.timeout_seconds))
        .build()
        .context("HTTP client build failed")?;

    // ---- Stage 1: extract ----
    let corpus = build_corpus(&client, &cfg, &games).await?;
    info!("🧮 Corpus: {} English reviews across {} games", corpus.len(), games.len());
    write_json(&corpus_path, &corpus)?;
    info!("💾 Checkpoint written: {}", corpus_path.display());

    if cli.skip_annotation {
        info!("✅ Extraction-only run complete.");
        return Ok(());
    }
    if corpus.is_empty() {
        warn!("Corpus is empty. Nothing to annotate.");
        return Ok(());
    }

    // ---- Stage 2: annotate ----
    let api_key = std::env::var("OPENAI_API_KEY")
        .context("Missing OPENAI_API_KEY env var. Set it (or pass --skip-annotation).")?;

    let generator = OpenAiGenerator {
        client,
        api_key,
        model: cfg.model.clone(),
        schema: batch_annotation_schema()?,
        max_retries: cfg.max_retries,
    };

    let batch_count = corpus.len().div_ceil(cfg.batch_size);
    let pb = ProgressBar::new(batch_count as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("=>-"),
    );
    pb.set_message("annotating…");

    let annotated = annotate_corpus(&generator, &corpus, cfg.batch_size, |done| {
        write_json(&annotated_path, &done)?;
        pb.inc(1);
        Ok(())
    })
    .await;

    pb.finish_with_message("done");

    let annotated = match annotated {
        Ok(a) => a,
        Err(e) => {
            // Batches annotated before the failure are already on disk.
            warn!("⚠️ Annotation halted: {e}");
            return Err(e);
        }
    };

    let parsed = annotated.iter().filter(|a| a.labels.is_parsed()).count();
    info!("🧮 Annotated {} reviews ({} parsed, {} sentinel)", annotated.len(), parsed, annotated.len() - parsed);
    info!("📦 Final corpus: {}", annotated_path.display());
    info!("✅ All done.");
    Ok(())
}

// ================================
// Tests
// ================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn raw_review(id: &str, language: &str, text: &str, votes_up: u64) -> serde_json::Value {
        json!({
            "recommendationid": id,
            "language": language,
            "review": text,
            "timestamp_created": 1_700_000_000,
            "voted_up": true,
            "votes_up": votes_up,
            "author": { "playtime_at_review": 120.0, "playtime_forever": 240.0 }
        })
    }

    fn review(id: &str, game_id: &str, text: &str) -> Review {
        Review {
            id: id.to_string(),
            game_id: game_id.to_string(),
            text: text.to_string(),
            recommended: true,
            playtime_hours: 2.0,
            language: "english".to_string(),
            timestamp: 1_700_000_000,
        }
    }

    fn labels_json(index: u32, learning: bool, shared: bool, category: &str) -> serde_json::Value {
        json!({
            "review_index": index,
            "perceived_learning": learning,
            "shared_context": shared,
            "language_category": category
        })
    }

    // ---- Extractor ----

    #[test]
    fn english_filter_drops_non_english() {
        let raw = vec![
            raw_review("1", "english", "We finally figured out the logistics network.", 3),
            raw_review("2", "german", "Sehr gutes Spiel, absolut empfehlenswert.", 2),
            raw_review("3", "english", "I learned so much about pressure systems.", 1),
        ];
        let reviews = normalize_game_reviews("coop_game_1", raw, None);
        assert_eq!(reviews.len(), 2);
        assert!(reviews.iter().all(|r| r.language == "english"));
    }

    #[test]
    fn malformed_records_are_skipped_not_counted() {
        let raw = vec![
            raw_review("1", "english", "A review long enough to keep around.", 5),
            json!({ "language": "english", "review": "No id on this one, sadly." }),
            json!("not even an object"),
        ];
        let reviews = normalize_game_reviews("factorio", raw, None);
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].id, "1");
    }

    #[test]
    fn short_reviews_are_skipped() {
        let raw = vec![
            raw_review("1", "english", "meh", 9),
            raw_review("2", "english", "This one is long enough to keep.", 1),
        ];
        let reviews = normalize_game_reviews("factorio", raw, None);
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].id, "2");
    }

    #[test]
    fn reviews_ordered_by_helpfulness_then_id() {
        let raw = vec![
            raw_review("30", "english", "Least helpful but still a keeper.", 1),
            raw_review("20", "english", "Tied on votes, higher id string.", 7),
            raw_review("10", "english", "Tied on votes, lower id string.", 7),
        ];
        let reviews = normalize_game_reviews("portal_2", raw, None);
        let ids: Vec<&str> = reviews.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["10", "20", "30"]);
    }

    #[test]
    fn review_limit_keeps_most_helpful() {
        let raw = vec![
            raw_review("1", "english", "Helpfulness three, should survive.", 3),
            raw_review("2", "english", "Helpfulness one, should be cut.", 1),
            raw_review("3", "english", "Helpfulness two, should survive.", 2),
        ];
        let reviews = normalize_game_reviews("subnautica", raw, Some(2));
        let ids: Vec<&str> = reviews.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[test]
    fn extraction_is_idempotent_on_fixed_snapshot() {
        let raw = vec![
            raw_review("2", "english", "Second review, perfectly ordinary.", 2),
            raw_review("1", "english", "First review, perfectly ordinary.", 4),
            raw_review("3", "french", "Très bon jeu, je le recommande.", 9),
        ];
        let first = normalize_game_reviews("factorio", raw.clone(), None);
        let second = normalize_game_reviews("factorio", raw, None);
        let a = serde_json::to_string_pretty(&first).unwrap();
        let b = serde_json::to_string_pretty(&second).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn playtime_converted_to_hours_at_review_time() {
        let raw = vec![raw_review("1", "english", "Long enough text to be retained.", 1)];
        let reviews = normalize_game_reviews("factorio", raw, None);
        assert_eq!(reviews[0].playtime_hours, 2.0);
    }

    #[test]
    fn corpus_round_trips_through_json() {
        let corpus = vec![
            review("1", "factorio", "We figured out trains together."),
            review("2", "subnautica", "I noticed the reactor hum changes."),
        ];
        let text = serde_json::to_string_pretty(&corpus).unwrap();
        let back: Vec<Review> = serde_json::from_str(&text).unwrap();
        assert_eq!(back, corpus);
    }

    #[test]
    fn cache_file_format_parses() {
        let file: RawReviewFile =
            serde_json::from_str(include_str!("../demos/sample_reviews.json")).unwrap();
        assert_eq!(file.reviews.len(), 4);
        let reviews =
            normalize_game_reviews("demo_coop_game", file.reviews.into_values().collect(), None);
        // One non-English and one too-short record drop out.
        assert_eq!(reviews.len(), 2);
        assert!(reviews.iter().all(|r| r.language == "english"));
    }

    // ---- Annotator: parsing ----

    #[test]
    fn partial_batch_output_marks_missing_as_sentinel() {
        let text = json!({
            "annotations": [labels_json(0, true, false, "epistemic")]
        })
        .to_string();
        let labels = parse_batch_labels(&text, 2);
        assert_eq!(
            labels[0],
            LabelSet::Parsed(ReviewLabels {
                perceived_learning: true,
                shared_context: false,
                language_category: LanguageCategory::Epistemic,
            })
        );
        assert_eq!(labels[1], LabelSet::unparsed());
    }

    #[test]
    fn garbage_output_marks_whole_batch_as_sentinel() {
        let labels = parse_batch_labels("Sure! Here are your annotations:", 3);
        assert_eq!(labels.len(), 3);
        assert!(labels.iter().all(|l| *l == LabelSet::unparsed()));
    }

    #[test]
    fn invalid_category_gets_sentinel_others_parse() {
        let text = json!({
            "annotations": [
                labels_json(0, false, false, "emotional"),
                labels_json(1, true, true, "mixed"),
            ]
        })
        .to_string();
        let labels = parse_batch_labels(&text, 2);
        assert_eq!(labels[0], LabelSet::unparsed());
        assert!(labels[1].is_parsed());
    }

    #[test]
    fn out_of_range_and_duplicate_indexes_dropped() {
        let text = json!({
            "annotations": [
                labels_json(5, true, true, "perception"),
                labels_json(0, true, false, "none"),
                labels_json(0, false, true, "mixed"),
            ]
        })
        .to_string();
        let labels = parse_batch_labels(&text, 2);
        // First annotation for index 0 wins, the duplicate is dropped.
        assert_eq!(
            labels[0],
            LabelSet::Parsed(ReviewLabels {
                perceived_learning: true,
                shared_context: false,
                language_category: LanguageCategory::None,
            })
        );
        assert_eq!(labels[1], LabelSet::unparsed());
    }

    #[test]
    fn bare_annotation_array_accepted() {
        let text = json!([labels_json(0, true, true, "perception")]).to_string();
        let labels = parse_batch_labels(&text, 1);
        assert!(labels[0].is_parsed());
    }

    #[test]
    fn sentinel_serializes_as_bare_string() {
        let annotated = AnnotatedReview {
            review: review("1", "factorio", "We learned the hard way."),
            labels: LabelSet::unparsed(),
        };
        let value = serde_json::to_value(&annotated).unwrap();
        assert_eq!(value["labels"], json!("unparsed"));
        // Review fields are flattened alongside the labels.
        assert_eq!(value["id"], json!("1"));
        assert_eq!(value["game_id"], json!("factorio"));

        let back: AnnotatedReview = serde_json::from_value(value).unwrap();
        assert_eq!(back, annotated);
    }

    #[test]
    fn parsed_labels_serialize_as_object() {
        let annotated = AnnotatedReview {
            review: review("1", "portal_2", "I saw the solution instantly."),
            labels: LabelSet::Parsed(ReviewLabels {
                perceived_learning: true,
                shared_context: false,
                language_category: LanguageCategory::Perception,
            }),
        };
        let value = serde_json::to_value(&annotated).unwrap();
        assert_eq!(value["labels"]["language_category"], json!("perception"));
        let back: AnnotatedReview = serde_json::from_value(value).unwrap();
        assert_eq!(back, annotated);
    }

    #[test]
    fn responses_payload_unwrapped_from_message_shape() {
        let payload = json!({
            "output": [
                { "type": "reasoning", "summary": [] },
                {
                    "type": "message",
                    "content": [
                        { "type": "output_text", "text": "{\"annotations\":[]}" }
                    ]
                }
            ]
        });
        assert_eq!(extract_output_text(&payload).as_deref(), Some("{\"annotations\":[]}"));
    }

    #[test]
    fn responses_payload_unwrapped_from_top_level_field() {
        let payload = json!({ "output_text": "{\"annotations\":[]}" });
        assert_eq!(extract_output_text(&payload).as_deref(), Some("{\"annotations\":[]}"));
        assert_eq!(extract_output_text(&json!({ "unrelated": 1 })), None);
    }

    #[test]
    fn batch_prompt_numbers_reviews() {
        let batch = vec![
            review("1", "factorio", "First text."),
            review("2", "factorio", "Second text."),
        ];
        let prompt = render_batch_prompt(&batch);
        assert!(prompt.contains("[0] First text."));
        assert!(prompt.contains("[1] Second text."));
    }

    #[test]
    fn schema_is_strict_and_inline() {
        let schema = batch_annotation_schema().unwrap();
        assert_eq!(schema["additionalProperties"], json!(false));
        let item = &schema["properties"]["annotations"]["items"];
        assert_eq!(item["additionalProperties"], json!(false));
        assert!(item.get("$ref").is_none());
        assert!(item["properties"]["review_index"].get("format").is_none());
    }

    // ---- Annotator: batch loop ----

    /// Scripted stand-in for the real model. Pops one canned response per
    /// generate() call.
    struct FakeGenerator {
        responses: RefCell<Vec<Result<String, PipelineError>>>,
    }

    impl FakeGenerator {
        fn new(responses: Vec<Result<String, PipelineError>>) -> Self {
            Self { responses: RefCell::new(responses) }
        }
    }

    impl TextGenerator for FakeGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String, PipelineError> {
            self.responses.borrow_mut().remove(0)
        }
    }

    fn full_batch_response(indexes: &[u32]) -> String {
        let annotations: Vec<serde_json::Value> = indexes
            .iter()
            .map(|i| labels_json(*i, true, false, "epistemic"))
            .collect();
        json!({ "annotations": annotations }).to_string()
    }

    #[tokio::test]
    async fn annotate_merges_labels_in_corpus_order() {
        let corpus = vec![
            review("1", "factorio", "We learned belts the hard way."),
            review("2", "factorio", "I noticed the biters adapt."),
            review("3", "portal_2", "My partner solved it before me."),
        ];
        let generator = FakeGenerator::new(vec![
            Ok(full_batch_response(&[0, 1])),
            Ok(full_batch_response(&[0])),
        ]);

        let mut snapshots = Vec::new();
        let annotated = annotate_corpus(&generator, &corpus, 2, |done| {
            snapshots.push(done.len());
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(annotated.len(), 3);
        assert!(annotated.iter().all(|a| a.labels.is_parsed()));
        let ids: Vec<&str> = annotated.iter().map(|a| a.review.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        // Persisted after each of the two batches.
        assert_eq!(snapshots, vec![2, 3]);
    }

    #[tokio::test]
    async fn annotate_applies_sentinel_for_underfilled_batch() {
        let corpus = vec![
            review("1", "factorio", "We learned belts the hard way."),
            review("2", "factorio", "I noticed the biters adapt."),
        ];
        // Model only annotates the first review of the two-review batch.
        let generator = FakeGenerator::new(vec![Ok(full_batch_response(&[0]))]);

        let annotated = annotate_corpus(&generator, &corpus, 2, |_| Ok(())).await.unwrap();
        assert!(annotated[0].labels.is_parsed());
        assert_eq!(annotated[1].labels, LabelSet::unparsed());
    }

    #[tokio::test]
    async fn model_failure_preserves_prior_batches() {
        let corpus = vec![
            review("1", "factorio", "We learned belts the hard way."),
            review("2", "factorio", "I noticed the biters adapt."),
            review("3", "portal_2", "My partner solved it before me."),
        ];
        let generator = FakeGenerator::new(vec![
            Ok(full_batch_response(&[0, 1])),
            Err(PipelineError::ModelCall { attempts: 3, reason: "quota".to_string() }),
        ]);

        let mut persisted = 0usize;
        let result = annotate_corpus(&generator, &corpus, 2, |done| {
            persisted = done.len();
            Ok(())
        })
        .await;

        assert!(result.is_err());
        // The first batch made it to the persistence callback before the halt.
        assert_eq!(persisted, 2);
    }
}
