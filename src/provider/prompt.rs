//! Host-side interactive prompts.
//!
//! Sandboxed scripts never draw prompts themselves: they ask the host, and the
//! host asks the user here. The broker uses the same seam for its permission
//! question.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use rustyline::DefaultEditor;
use rustyline::config::Behavior;
use rustyline::error::ReadlineError;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::ipc::protocol::{
    Choice, ConfirmPrompt, FieldKind, FormField, FormPrompt, InputPrompt, MultiSelectPrompt,
    SelectPrompt,
};

/// A prompt either gets an answer or the user backs out of it.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptAnswer<T> {
    Answered(T),
    Cancelled,
}

impl<T> PromptAnswer<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> PromptAnswer<U> {
        match self {
            PromptAnswer::Answered(v) => PromptAnswer::Answered(f(v)),
            PromptAnswer::Cancelled => PromptAnswer::Cancelled,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Whether a human is available to answer.
    fn is_interactive(&self) -> bool;

    async fn input(&self, prompt: &InputPrompt) -> Result<PromptAnswer<String>>;

    /// Resolves to the chosen `value`.
    async fn select(&self, prompt: &SelectPrompt) -> Result<PromptAnswer<String>>;

    async fn confirm(&self, prompt: &ConfirmPrompt) -> Result<PromptAnswer<bool>>;

    async fn multiselect(&self, prompt: &MultiSelectPrompt) -> Result<PromptAnswer<Vec<String>>>;

    async fn form(&self, prompt: &FormPrompt) -> Result<PromptAnswer<Map<String, Value>>>;
}

/// Prompts on the controlling terminal.
///
/// Prompts are serialized: two concurrent requests from one script are asked
/// one after the other, never interleaved.
pub struct TerminalPrompter {
    interactive: bool,
    lock: Mutex<()>,
}

impl TerminalPrompter {
    pub fn new(interactive: bool) -> Self {
        Self {
            interactive,
            lock: Mutex::new(()),
        }
    }

    fn ensure_interactive(&self) -> Result<()> {
        if !self.interactive {
            bail!("No interactive terminal available to answer the prompt");
        }
        Ok(())
    }
}

#[async_trait]
impl Prompter for TerminalPrompter {
    fn is_interactive(&self) -> bool {
        self.interactive
    }

    async fn input(&self, prompt: &InputPrompt) -> Result<PromptAnswer<String>> {
        self.ensure_interactive()?;
        let _guard = self.lock.lock().await;

        let mut label = sanitize_for_terminal(&prompt.message);
        if let Some(ref placeholder) = prompt.placeholder {
            label.push_str(&format!(" ({})", sanitize_for_terminal(placeholder)));
        }
        let initial = prompt.default.as_deref().map(sanitize_for_terminal);

        blocking(move || Ok(read_line(&format!("{}: ", label), initial.as_deref())?.into())).await
    }

    async fn select(&self, prompt: &SelectPrompt) -> Result<PromptAnswer<String>> {
        self.ensure_interactive()?;
        if prompt.choices.is_empty() {
            bail!("Select prompt has no choices");
        }
        let _guard = self.lock.lock().await;

        let message = sanitize_block(&prompt.message);
        let choices = prompt.choices.clone();
        blocking(move || {
            eprintln!("{}", message);
            print_choices(&choices);
            loop {
                let Some(line) = read_line("Choose: ", None)? else {
                    return Ok(PromptAnswer::Cancelled);
                };
                match parse_selection(&line, &choices) {
                    Some(index) => return Ok(PromptAnswer::Answered(choices[index].value.clone())),
                    None => eprintln!("Enter a number between 1 and {}", choices.len()),
                }
            }
        })
        .await
    }

    async fn confirm(&self, prompt: &ConfirmPrompt) -> Result<PromptAnswer<bool>> {
        self.ensure_interactive()?;
        let _guard = self.lock.lock().await;

        let message = sanitize_for_terminal(&prompt.message);
        let default = prompt.default;
        let hint = match default {
            Some(true) => "[Y/n]",
            Some(false) => "[y/N]",
            None => "[y/n]",
        };
        blocking(move || loop {
            let Some(line) = read_line(&format!("{} {} ", message, hint), None)? else {
                return Ok(PromptAnswer::Cancelled);
            };
            match parse_confirm(&line, default) {
                Some(answer) => return Ok(PromptAnswer::Answered(answer)),
                None => eprintln!("Please answer y or n"),
            }
        })
        .await
    }

    async fn multiselect(&self, prompt: &MultiSelectPrompt) -> Result<PromptAnswer<Vec<String>>> {
        self.ensure_interactive()?;
        let _guard = self.lock.lock().await;

        let message = sanitize_block(&prompt.message);
        let choices = prompt.choices.clone();
        let required = prompt.required;
        blocking(move || {
            eprintln!("{}", message);
            print_choices(&choices);
            loop {
                let Some(line) = read_line("Choose (comma separated): ", None)? else {
                    return Ok(PromptAnswer::Cancelled);
                };
                match parse_multi_selection(&line, choices.len()) {
                    Some(picked) if required && picked.is_empty() => {
                        eprintln!("Pick at least one option");
                    }
                    Some(picked) => {
                        return Ok(PromptAnswer::Answered(
                            picked.into_iter().map(|i| choices[i].value.clone()).collect(),
                        ));
                    }
                    None => eprintln!("Enter numbers between 1 and {}", choices.len()),
                }
            }
        })
        .await
    }

    async fn form(&self, prompt: &FormPrompt) -> Result<PromptAnswer<Map<String, Value>>> {
        self.ensure_interactive()?;
        let _guard = self.lock.lock().await;

        let title = prompt.title.as_deref().map(sanitize_block);
        let fields = prompt.fields.clone();
        blocking(move || {
            if let Some(title) = title {
                eprintln!("{}", title);
            }
            let mut values = Map::new();
            for field in &fields {
                let label = sanitize_for_terminal(field.label.as_deref().unwrap_or(&field.name));
                if field.kind == FieldKind::Select {
                    print_choices(&field.choices);
                }
                let initial = field.default.as_ref().map(default_text);
                loop {
                    let Some(line) = read_line(&format!("{}: ", label), initial.as_deref())? else {
                        return Ok(PromptAnswer::Cancelled);
                    };
                    match coerce_field(field, &line) {
                        Ok(value) => {
                            values.insert(field.name.clone(), value);
                            break;
                        }
                        Err(reason) => eprintln!("{}", reason),
                    }
                }
            }
            Ok(PromptAnswer::Answered(values))
        })
        .await
    }
}

impl From<Option<String>> for PromptAnswer<String> {
    fn from(line: Option<String>) -> Self {
        match line {
            Some(line) => PromptAnswer::Answered(line),
            None => PromptAnswer::Cancelled,
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("Prompt task failed")?
}

/// One line from the terminal. `None` when the user pressed Ctrl-C or Ctrl-D.
fn read_line(prompt: &str, initial: Option<&str>) -> Result<Option<String>> {
    // Draw on the terminal, not stdout: stdout belongs to the script.
    let config = rustyline::Config::builder()
        .behavior(Behavior::PreferTerm)
        .auto_add_history(false)
        .build();
    let mut rl = DefaultEditor::with_config(config)?;

    let line = match initial {
        Some(initial) => rl.readline_with_initial(prompt, (initial, "")),
        None => rl.readline(prompt),
    };
    match line {
        Ok(line) => Ok(Some(line)),
        Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn print_choices(choices: &[Choice]) {
    for (i, choice) in choices.iter().enumerate() {
        match choice.description {
            Some(ref description) => eprintln!(
                "  {}) {} - {}",
                i + 1,
                sanitize_for_terminal(choice.display_label()),
                sanitize_for_terminal(description)
            ),
            None => eprintln!("  {}) {}", i + 1, sanitize_for_terminal(choice.display_label())),
        }
    }
}

fn default_text(value: &Value) -> String {
    match value {
        Value::String(s) => sanitize_for_terminal(s),
        Value::Bool(true) => "y".to_string(),
        Value::Bool(false) => "n".to_string(),
        other => other.to_string(),
    }
}

/// 1-based index or exact value.
fn parse_selection(input: &str, choices: &[Choice]) -> Option<usize> {
    let input = input.trim();
    if let Ok(n) = input.parse::<usize>() {
        return (1..=choices.len()).contains(&n).then(|| n - 1);
    }
    choices.iter().position(|c| c.value == input)
}

fn parse_multi_selection(input: &str, len: usize) -> Option<Vec<usize>> {
    let mut picked = Vec::new();
    for part in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let n: usize = part.parse().ok()?;
        if !(1..=len).contains(&n) {
            return None;
        }
        if !picked.contains(&(n - 1)) {
            picked.push(n - 1);
        }
    }
    Some(picked)
}

fn parse_confirm(input: &str, default: Option<bool>) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        "" => default,
        _ => None,
    }
}

fn coerce_field(field: &FormField, input: &str) -> std::result::Result<Value, String> {
    let input = input.trim();
    if input.is_empty() {
        if let Some(ref default) = field.default {
            return Ok(default.clone());
        }
        if field.required {
            return Err(format!("{} is required", field.name));
        }
        return Ok(Value::Null);
    }

    match field.kind {
        FieldKind::Text => Ok(Value::String(input.to_string())),
        FieldKind::Number => input
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(|n| match input.parse::<i64>() {
                Ok(i) => Value::from(i),
                Err(_) => Value::Number(n),
            })
            .ok_or_else(|| format!("{} must be a number", field.name)),
        FieldKind::Boolean => parse_confirm(input, None)
            .map(Value::Bool)
            .ok_or_else(|| format!("{} must be y or n", field.name)),
        FieldKind::Select => parse_selection(input, &field.choices)
            .map(|i| Value::String(field.choices[i].value.clone()))
            .ok_or_else(|| format!("Pick one of 1-{}", field.choices.len())),
    }
}

/// Sanitize multi-line text, keeping the line breaks.
pub fn sanitize_block(input: &str) -> String {
    input
        .lines()
        .map(sanitize_for_terminal)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Strip terminal escape sequences and control characters from untrusted text.
///
/// Escape sequences are dropped whole; any other control character becomes a
/// space so it cannot rewrite what the user sees.
pub fn sanitize_for_terminal(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            match chars.peek() {
                Some('[') => {
                    chars.next();
                    for seq_c in chars.by_ref() {
                        if ('\x40'..='\x7e').contains(&seq_c) {
                            break;
                        }
                    }
                }
                Some(']' | 'P' | '_' | '^' | 'X') => {
                    chars.next();
                    let mut prev = '\0';
                    for seq_c in chars.by_ref() {
                        if seq_c == '\x07' || (prev == '\x1b' && seq_c == '\\') {
                            break;
                        }
                        prev = seq_c;
                    }
                }
                _ => {}
            }
            continue;
        }

        if c.is_control() {
            result.push(' ');
        } else {
            result.push(c);
        }
    }

    result
}
