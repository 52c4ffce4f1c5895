//! HTML for the generation form and its result panel.

use std::fmt::Write;

use base64::{prelude::BASE64_STANDARD, Engine};
use fluxgen_core::{MAX_SIZE, SIZE_MULTIPLE};

pub const TITLE: &str = "Flux Image Generation Demo";

pub const MIN_SIZE: usize = 128;
pub const MAX_STEPS: usize = 50;
pub const MIN_GUIDANCE: f64 = 1.0;
pub const MAX_GUIDANCE: f64 = 10.0;

/// Current values of the form widgets.
#[derive(Debug, Clone, PartialEq)]
pub struct FormValues {
    pub model: String,
    pub prompt: String,
    pub width: usize,
    pub height: usize,
    pub num_steps: usize,
    pub guidance: f64,
    pub seed: String,
    pub add_sampling_metadata: bool,
    /// Whether the guidance slider is editable for `model`.
    pub guidance_enabled: bool,
}

/// What the result panel shows after a submit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResultView {
    pub seed: String,
    pub image: Option<SavedFile>,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFile {
    pub file_name: String,
    pub jpeg: Vec<u8>,
}

pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[allow(clippy::too_many_arguments)]
fn slider(
    out: &mut String,
    label: &str,
    name: &str,
    min: f64,
    max: f64,
    step: f64,
    value: f64,
    enabled: bool,
) {
    let disabled = if enabled { "" } else { " disabled" };
    let _ = write!(
        out,
        r#"<label>{label} <input type="range" name="{name}" min="{min}" max="{max}" step="{step}" value="{value}"{disabled} oninput="this.nextElementSibling.value=this.value"><output>{value}</output></label>"#
    );
    if !enabled {
        // disabled inputs are not submitted
        let _ = write!(out, r#"<input type="hidden" name="{name}" value="{value}">"#);
    }
}

fn render_form(out: &mut String, root: &str, models: &[String], form: &FormValues) {
    let _ = write!(
        out,
        r#"<form method="post" action="{}/" class="column">"#,
        escape(root)
    );

    let selectable = models.len() > 1;
    let _ = write!(
        out,
        r#"<label>Model <select name="model"{}>"#,
        if selectable { "" } else { " disabled" }
    );
    for model in models {
        let selected = if *model == form.model { " selected" } else { "" };
        let model = escape(model);
        let _ = write!(out, r#"<option value="{model}"{selected}>{model}</option>"#);
    }
    out.push_str("</select></label>");
    if !selectable {
        let _ = write!(
            out,
            r#"<input type="hidden" name="model" value="{}">"#,
            escape(&form.model)
        );
    }

    let _ = write!(
        out,
        r#"<label>Prompt <textarea name="prompt" rows="3">{}</textarea></label>"#,
        escape(&form.prompt)
    );

    out.push_str("<details><summary>Advanced Options</summary>");
    let (min, max, step) = (MIN_SIZE as f64, MAX_SIZE as f64, SIZE_MULTIPLE as f64);
    slider(out, "Width", "width", min, max, step, form.width as f64, true);
    slider(out, "Height", "height", min, max, step, form.height as f64, true);
    let steps = form.num_steps as f64;
    slider(out, "Number of steps", "num_steps", 1.0, MAX_STEPS as f64, 1.0, steps, true);
    slider(
        out,
        "Guidance",
        "guidance",
        MIN_GUIDANCE,
        MAX_GUIDANCE,
        0.1,
        form.guidance,
        form.guidance_enabled,
    );
    let _ = write!(
        out,
        r#"<label>Seed (-1 for random) <input type="text" name="seed" value="{}"></label>"#,
        escape(&form.seed)
    );
    let _ = write!(
        out,
        r#"<label><input type="checkbox" name="add_sampling_metadata"{}> Add sampling parameters to metadata?</label>"#,
        if form.add_sampling_metadata { " checked" } else { "" }
    );
    out.push_str("</details>");

    out.push_str(r#"<button type="submit">Generate</button></form>"#);
}

fn render_result(out: &mut String, root: &str, result: &ResultView) {
    out.push_str(r#"<div class="column">"#);
    match &result.image {
        Some(file) => {
            let _ = write!(
                out,
                r#"<img alt="Generated Image" src="data:image/jpeg;base64,{}">"#,
                BASE64_STANDARD.encode(&file.jpeg)
            );
        }
        None => out.push_str(r#"<div class="placeholder">Generated Image</div>"#),
    }
    let _ = write!(
        out,
        r#"<label>Used Seed <input type="text" readonly value="{}"></label>"#,
        escape(&result.seed)
    );
    if let Some(warning) = &result.warning {
        let _ = write!(
            out,
            r#"<label class="warning">Warning <input type="text" readonly value="{}"></label>"#,
            escape(warning)
        );
    }
    if let Some(file) = &result.image {
        let name = escape(&file.file_name);
        let root = escape(root);
        let _ = write!(
            out,
            r#"<a href="{root}/file/{name}" download="{name}">Download full-resolution</a>"#
        );
    }
    out.push_str("</div>");
}

/// Normalises a reverse-proxy prefix: `""` or `"/a/b"`, never a trailing slash.
pub fn normalize_root_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

/// Renders the whole page. `root` is the normalised prefix the UI is served under.
pub fn render(
    root: &str,
    models: &[String],
    form: &FormValues,
    result: Option<&ResultView>,
) -> String {
    let mut out = String::new();
    let _ = write!(
        out,
        r#"<!DOCTYPE html><html><head><meta charset="utf-8"><title>{TITLE}</title><style>{STYLE}</style></head><body><h1>{TITLE}</h1><div class="row">"#
    );
    render_form(&mut out, root, models, form);
    render_result(&mut out, root, result.unwrap_or(&ResultView::default()));
    out.push_str("</div></body></html>");
    out
}

const STYLE: &str = "body{font-family:sans-serif;margin:2em}\
.row{display:flex;gap:2em;flex-wrap:wrap}\
.column{flex:1;min-width:320px;display:flex;flex-direction:column;gap:.8em}\
label{display:flex;flex-direction:column;gap:.3em}\
img{max-width:100%}\
.placeholder{border:1px dashed #999;min-height:240px;display:flex;align-items:center;justify-content:center;color:#999}\
.warning input{color:#b00}";
