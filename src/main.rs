//! # Python Auto-Fixer (pyautofix)
//!
//! A CLI tool that lints a Python file, repairs misspelled or undefined
//! names, reformats the result and shows which lines changed.
//!
//! ## Overview
//!
//! `pyautofix` checks that the file parses, runs an external linter (pylint
//! by default), reads the linter's findings and, for every
//! `undefined-variable` finding, replaces the offending name with the
//! closest name the file actually defines. The repaired text is handed to
//! an external PEP8 formatter (autopep8 by default) and compared
//! line-by-line against the original.
//!
//! ## Key Components
//!
//! - **Diagnostic Extraction**: `<file>:<line>:<column>: <code>: <message>`
//!   lines become structured diagnostics; undefined names are pulled out of
//!   their quoted message text.
//! - **Symbol Collection**: positional parameters of every `def` and every
//!   bare-name assignment target, collected from a tree-sitter parse.
//! - **Repair**: nearest known symbol by Levenshtein distance, substituted
//!   on the reported line when the distance is small enough.
//! - **Diff Rendering**: positional comparison of trimmed lines, or a Myers
//!   alignment with `--diff-mode aligned`.
//!
//! ## Pipeline
//!
//! ```text
//! File → Syntax Check → Symbols ─┐
//!            ↓                   ├→ Repair → Format → Diff → Report
//!          Linter → Diagnostics ─┘
//! ```
//!
//! ## Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | General error (file not found, permission denied, I/O error) |
//! | 2 | Invalid command-line arguments |
//! | 3 | Dry-run mode: changes would be made |
//! | 4 | Parse error (invalid UTF-8 or binary input) |
//! | 5 | Python syntax error in the input |
//! | 6 | Formatter rejected the repaired code |

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use anyhow::{Context, Result};
use clap::ValueEnum;
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::{NoExpand, Regex};
use rich_rust::terminal;
use rich_rust::{ColorSystem, Console};
use serde::{Deserialize, Serialize};
use similar::{Algorithm, ChangeTag, DiffOp, TextDiff};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, mpsc};
use std::thread;
use std::time::{Duration, Instant};
use tree_sitter::{Node, Tree};

// ─────────────────────────────────────────────────────────────────────────────
// Exit Codes
// ─────────────────────────────────────────────────────────────────────────────

/// Semantic exit codes for scripting and CI integration
mod exit_codes {
    /// Success - completed without errors
    pub const SUCCESS: i32 = 0;
    /// General error (file not found, permission denied, I/O error)
    pub const ERROR: i32 = 1;
    /// Invalid command-line arguments
    pub const INVALID_ARGS: i32 = 2;
    /// Dry-run mode: changes would be made
    pub const WOULD_CHANGE: i32 = 3;
    /// Parse error (invalid UTF-8 or binary file detected)
    pub const PARSE_ERROR: i32 = 4;
    /// The input is not valid Python
    pub const SYNTAX_ERROR: i32 = 5;
    /// The formatter rejected the repaired code
    pub const FORMAT_ERROR: i32 = 6;
}

#[derive(Debug)]
struct ArgError(String);

impl fmt::Display for ArgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ArgError {}

#[derive(Debug)]
struct ParseError(String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ParseError {}

/// Python source that failed to parse. Positions are 1-indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SyntaxError {
    line: usize,
    column: usize,
    message: String,
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (line {}, column {})",
            self.message, self.line, self.column
        )
    }
}

impl std::error::Error for SyntaxError {}

#[derive(Debug)]
struct FormatError(String);

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for FormatError {}

#[derive(Debug)]
struct RunOutcome {
    dry_run: bool,
    would_change: bool,
}

fn error_chain_has<T: std::error::Error + 'static>(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<T>())
}

fn exit_code_for_error(err: &anyhow::Error) -> i32 {
    if error_chain_has::<ArgError>(err) {
        exit_codes::INVALID_ARGS
    } else if error_chain_has::<ParseError>(err) {
        exit_codes::PARSE_ERROR
    } else if error_chain_has::<SyntaxError>(err) {
        exit_codes::SYNTAX_ERROR
    } else if error_chain_has::<FormatError>(err) {
        exit_codes::FORMAT_ERROR
    } else {
        exit_codes::ERROR
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CLI Arguments
// ─────────────────────────────────────────────────────────────────────────────

/// Linter command used when neither the CLI nor a config file names one
const DEFAULT_LINTER: &str = "pylint";

/// Formatter command used when neither the CLI nor a config file names one.
/// The repaired source is written to its stdin.
const DEFAULT_FORMATTER: &str = "autopep8 -";

/// Largest edit distance at which a known symbol replaces an undefined name
const DEFAULT_MAX_DISTANCE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ReplaceMode {
    /// Replace the first raw substring match on the line
    Substring,
    /// Replace the first whole-identifier match on the line
    Identifier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DiffMode {
    /// Compare line i of the corrected code with line i of the original
    Positional,
    /// Align lines first so one insertion does not mark every later line
    Aligned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ColorMode {
    /// Auto-detect color support
    Auto,
    /// Always emit colors (even when not a TTY)
    Always,
    /// Never emit colors
    Never,
}

/// Python auto-fixer: lints a file, repairs misspelled names and reformats it
#[derive(Parser, Debug)]
#[command(
    name = "pyautofix",
    version,
    about,
    long_about = None,
    after_help = "EXIT CODES:\n  0  Success\n  1  General error (file not found, permission denied, I/O error)\n  2  Invalid command-line arguments\n  3  Dry-run mode: changes would be made\n  4  Parse error (invalid UTF-8 or binary input)\n  5  Python syntax error in the input\n  6  Formatter rejected the repaired code\n"
)]
struct Args {
    /// Python file to check and repair
    #[arg(value_name = "FILE")]
    input: Option<PathBuf>,

    /// Path to config file (default: search for .pyautofixrc)
    #[arg(long = "config", value_name = "FILE")]
    config_file: Option<PathBuf>,

    /// Ignore config files
    #[arg(long = "no-config")]
    no_config: bool,

    /// Save the corrected code to FILE (overwrites)
    #[arg(short = 'o', long, value_name = "FILE", conflicts_with = "in_place")]
    output: Option<PathBuf>,

    /// Overwrite the input file with the corrected code
    #[arg(short = 'i', long)]
    in_place: bool,

    /// Create backup file before in-place editing
    #[arg(long, requires = "in_place")]
    backup: bool,

    /// Extension for backup files (default: .bak)
    #[arg(long, default_value = ".bak", requires = "backup")]
    backup_ext: String,

    /// Linter command; the file path is appended as the last argument
    #[arg(long, value_name = "CMD", default_value = DEFAULT_LINTER)]
    linter: String,

    /// Formatter command; reads source on stdin and writes it to stdout
    #[arg(long, value_name = "CMD", default_value = DEFAULT_FORMATTER)]
    formatter: String,

    /// Skip the formatter and keep the repaired code as-is
    #[arg(long = "no-format")]
    no_format: bool,

    /// Read linter output from FILE instead of running the linter
    #[arg(long, value_name = "FILE")]
    lint_report: Option<PathBuf>,

    /// Largest edit distance at which a known name replaces an undefined one
    #[arg(long, default_value_t = DEFAULT_MAX_DISTANCE)]
    max_distance: usize,

    /// How an undefined name is replaced on its line
    #[arg(long, value_enum, default_value = "substring")]
    replace_mode: ReplaceMode,

    /// How changed lines are detected
    #[arg(long, value_enum, default_value = "positional")]
    diff_mode: DiffMode,

    /// Print only the corrected code
    #[arg(long, conflicts_with_all = ["diff", "json"])]
    corrected: bool,

    /// Show unified diff of changes instead of the report
    #[arg(short = 'd', long)]
    diff: bool,

    /// Preview without writing any file (exit 0=no changes, 3=would change)
    #[arg(short = 'n', long, conflicts_with_all = ["in_place", "output"])]
    dry_run: bool,

    /// Watch the file and re-run the fixer on every save
    #[arg(short = 'w', long, conflicts_with_all = ["in_place", "diff", "dry_run", "json", "corrected"])]
    watch: bool,

    /// Debounce interval in milliseconds (for --watch mode)
    #[arg(long, default_value = "500", requires = "watch")]
    debounce_ms: u64,

    /// Verbose output showing pipeline progress
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Color output: auto, always, or never
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorMode,

    /// Output results as JSON for programmatic processing
    #[arg(long, conflicts_with_all = ["verbose", "diff"])]
    json: bool,

    /// Subcommand (config management)
    #[command(subcommand)]
    command: Option<Commands>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Subcommands
// ─────────────────────────────────────────────────────────────────────────────

/// Available subcommands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config management actions
#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Initialize a new .pyautofixrc config file
    Init {
        /// Create in home directory instead of current
        #[arg(long)]
        global: bool,
    },
    /// Show effective configuration (merged file + CLI)
    Show,
    /// Show path to active config file
    Path,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration and Statistics
// ─────────────────────────────────────────────────────────────────────────────

/// Runtime configuration derived from CLI args
#[derive(Debug)]
struct Config {
    linter: String,
    formatter: String,
    format: bool,
    lint_report: Option<PathBuf>,
    max_distance: usize,
    replace_mode: ReplaceMode,
    diff_mode: DiffMode,
    color: ColorMode,
    verbose: bool,
    corrected: bool,
    diff: bool,
    dry_run: bool,
    watch: bool,
    debounce_ms: u64,
    backup: bool,
    backup_ext: String,
    json: bool,
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Self {
            linter: args.linter.clone(),
            formatter: args.formatter.clone(),
            format: !args.no_format,
            lint_report: args.lint_report.clone(),
            max_distance: args.max_distance,
            replace_mode: args.replace_mode,
            diff_mode: args.diff_mode,
            color: args.color,
            verbose: args.verbose,
            corrected: args.corrected,
            diff: args.diff,
            dry_run: args.dry_run,
            watch: args.watch,
            debounce_ms: args.debounce_ms,
            backup: args.backup,
            backup_ext: args.backup_ext.clone(),
            json: args.json,
        }
    }
}

impl Config {
    fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            repair: RepairOptions {
                max_distance: self.max_distance,
                mode: self.replace_mode,
            },
            diff_mode: self.diff_mode,
        }
    }
}

struct VerboseStyle {
    use_color: bool,
}

impl VerboseStyle {
    fn new(use_color: bool) -> Self {
        Self { use_color }
    }

    fn wrap(&self, tag: &str, text: impl fmt::Display) -> String {
        if self.use_color {
            format!("[{}]{}[/]", tag, text)
        } else {
            text.to_string()
        }
    }

    fn header(&self, text: impl fmt::Display) -> String {
        self.wrap("bold cyan", text)
    }

    fn warning(&self, text: impl fmt::Display) -> String {
        self.wrap("yellow", text)
    }

    fn success(&self, text: impl fmt::Display) -> String {
        self.wrap("bold green", text)
    }

    fn dim(&self, text: impl fmt::Display) -> String {
        self.wrap("dim", text)
    }

    fn bold(&self, text: impl fmt::Display) -> String {
        self.wrap("bold", text)
    }

    fn stat_label(&self, text: impl fmt::Display) -> String {
        self.wrap("bold blue", text)
    }

    fn separator(&self) -> String {
        self.wrap("dim", "───")
    }
}

/// Escape console markup so source text is printed literally
fn escape_markup(text: &str) -> String {
    text.replace('[', "\\[")
}

/// Print a statistics summary
fn print_stats_summary(stats: &Stats, console: &Console, styles: &VerboseStyle) {
    console.print("");
    console.print(&format!(
        "{} Summary {}",
        styles.separator(),
        styles.separator()
    ));

    console.print(&format!(
        "  {} {} found, {} undefined name(s)",
        styles.stat_label("Diagnostics:"),
        stats.diagnostics,
        stats.undefined_names
    ));

    console.print(&format!(
        "  {} {} applied, {} skipped ({} known symbol(s))",
        styles.stat_label("Fixes:"),
        stats.fixes_applied,
        stats.fixes_skipped,
        stats.known_symbols
    ));

    console.print(&format!(
        "  {} {} of {} changed",
        styles.stat_label("Lines:"),
        stats.lines_changed,
        stats.total_lines
    ));

    let elapsed_ms = stats.elapsed.as_secs_f64() * 1000.0;
    console.print(&format!(
        "  {} {:.2}ms ({:.0} lines/sec)",
        styles.stat_label("Time:"),
        elapsed_ms,
        stats.lines_per_second()
    ));

    console.print("");
}

/// Console that emits styles even when stdout is not a terminal
fn forced_color_console() -> (Console, VerboseStyle) {
    let system = terminal::detect_color_system().unwrap_or(ColorSystem::Standard);
    let console = Console::builder()
        .force_terminal(true)
        .color_system(system)
        .build();
    (console, VerboseStyle::new(true))
}

fn build_console(color: ColorMode) -> (Console, VerboseStyle) {
    let env_set = |name: &str| std::env::var_os(name).is_some();

    match color {
        ColorMode::Never => (Console::new(), VerboseStyle::new(false)),
        ColorMode::Auto if env_set("NO_COLOR") => (Console::new(), VerboseStyle::new(false)),
        ColorMode::Always => forced_color_console(),
        ColorMode::Auto if env_set("FORCE_COLOR") => forced_color_console(),
        ColorMode::Auto => {
            let console = Console::new();
            let use_color = console.is_color_enabled();
            (console, VerboseStyle::new(use_color))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Config File Support
// ─────────────────────────────────────────────────────────────────────────────

/// Config file names searched in order
const CONFIG_FILENAMES: &[&str] = &[".pyautofixrc", ".pyautofixrc.toml", "pyautofixrc.toml"];

/// Configuration loaded from a .pyautofixrc file
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct FileConfig {
    /// Linter command line
    linter: Option<String>,
    /// Formatter command line
    formatter: Option<String>,
    /// Run the formatter (false = keep repaired code as-is)
    format: Option<bool>,
    /// Largest accepted edit distance for a repair
    max_distance: Option<usize>,
    /// substring or identifier
    replace_mode: Option<ReplaceMode>,
    /// positional or aligned
    diff_mode: Option<DiffMode>,
    /// Show verbose output
    verbose: Option<bool>,
    /// Color mode: auto, always, never
    color: Option<ColorMode>,
    /// Output as JSON
    json: Option<bool>,
    /// Create backup before in-place edit
    backup: Option<bool>,
    /// Backup file extension
    backup_ext: Option<String>,
}

/// Every key filled in, for `config show`
impl From<&Config> for FileConfig {
    fn from(config: &Config) -> Self {
        Self {
            linter: Some(config.linter.clone()),
            formatter: Some(config.formatter.clone()),
            format: Some(config.format),
            max_distance: Some(config.max_distance),
            replace_mode: Some(config.replace_mode),
            diff_mode: Some(config.diff_mode),
            verbose: Some(config.verbose),
            color: Some(config.color),
            json: Some(config.json),
            backup: Some(config.backup),
            backup_ext: Some(config.backup_ext.clone()),
        }
    }
}

/// Nearest config file in `start_dir` or any parent, then in the home directory
fn find_config_file(start_dir: &Path) -> Option<PathBuf> {
    let home = dirs::home_dir();

    start_dir
        .ancestors()
        .chain(home.as_deref())
        .flat_map(|dir| CONFIG_FILENAMES.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

/// Load and parse a config file
fn load_config_file(path: &Path) -> Result<FileConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Apply file config values wherever the CLI kept its default
fn merge_file_config(config: &mut Config, args: &Args, file_config: FileConfig) {
    if args.linter == DEFAULT_LINTER {
        if let Some(linter) = file_config.linter {
            config.linter = linter;
        }
    }

    if args.formatter == DEFAULT_FORMATTER {
        if let Some(formatter) = file_config.formatter {
            config.formatter = formatter;
        }
    }

    if !args.no_format {
        if let Some(format) = file_config.format {
            config.format = format;
        }
    }

    if args.max_distance == DEFAULT_MAX_DISTANCE {
        if let Some(distance) = file_config.max_distance {
            config.max_distance = distance;
        }
    }

    if args.replace_mode == ReplaceMode::Substring {
        if let Some(mode) = file_config.replace_mode {
            config.replace_mode = mode;
        }
    }

    if args.diff_mode == DiffMode::Positional {
        if let Some(mode) = file_config.diff_mode {
            config.diff_mode = mode;
        }
    }

    if !args.verbose {
        if let Some(v) = file_config.verbose {
            config.verbose = v;
        }
    }

    if args.color == ColorMode::Auto {
        if let Some(c) = file_config.color {
            config.color = c;
        }
    }

    if !args.json {
        if let Some(j) = file_config.json {
            config.json = j;
        }
    }

    if !args.backup {
        if let Some(b) = file_config.backup {
            config.backup = b;
        }
    }

    if args.backup_ext == ".bak" {
        if let Some(ext) = file_config.backup_ext {
            config.backup_ext = ext;
        }
    }
}

/// Create Config by merging file config with CLI args (CLI wins)
fn create_config(args: &Args) -> Result<Config> {
    let mut config = Config::from(args);

    if args.no_config {
        return Ok(config);
    }

    let config_path = if let Some(ref path) = args.config_file {
        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }
        Some(path.clone())
    } else {
        let start_dir = args
            .input
            .as_ref()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

        find_config_file(&start_dir)
    };

    if let Some(path) = config_path {
        let file_config = load_config_file(&path)?;
        merge_file_config(&mut config, args, file_config);
    }

    // JSON output owns stdout; verbose progress would corrupt it
    if config.json {
        config.verbose = false;
    }

    Ok(config)
}

/// Default config file content
const DEFAULT_CONFIG: &str = r#"# .pyautofixrc - pyautofix configuration file
# https://github.com/Dicklesworthstone/pyautofix

# External tools. The linter gets the file path appended; the formatter
# reads the repaired source on stdin.
linter = "pylint"
formatter = "autopep8 -"
# format = true

# Largest edit distance at which a known name replaces an undefined one
max_distance = 2

# substring: replace the first raw match on the line
# identifier: replace the first whole-identifier match
replace_mode = "substring"

# positional: compare line i with line i
# aligned: align lines before comparing
diff_mode = "positional"

# Output options
# verbose = false
# color = "auto"
# json = false

# Backup options (for --in-place)
# backup = false
# backup_ext = ".bak"
"#;

/// Handle the config subcommand
fn run_config_command(action: &ConfigAction) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to read current directory")?;

    match action {
        ConfigAction::Init { global } => init_config_file(*global),
        ConfigAction::Show => {
            let config = create_config(&Args::parse_from(["pyautofix"]))?;
            let effective = toml::to_string_pretty(&FileConfig::from(&config))
                .context("Failed to render configuration")?;

            match find_config_file(&cwd) {
                Some(path) => println!("# Effective configuration ({})", path.display()),
                None => println!("# Effective configuration (built-in defaults)"),
            }
            print!("{}", effective);
            Ok(())
        }
        ConfigAction::Path => {
            let path = find_config_file(&cwd)
                .ok_or_else(|| anyhow::anyhow!("No config file found"))?;
            println!("{}", path.display());
            Ok(())
        }
    }
}

/// Write [`DEFAULT_CONFIG`] to `./.pyautofixrc` or `~/.pyautofixrc`
fn init_config_file(global: bool) -> Result<()> {
    let dir = if global {
        dirs::home_dir().context("Could not determine home directory")?
    } else {
        PathBuf::from(".")
    };
    let path = dir.join(".pyautofixrc");

    if path.exists() {
        anyhow::bail!("Config file already exists: {}", path.display());
    }

    fs::write(&path, DEFAULT_CONFIG)
        .with_context(|| format!("Failed to create config file: {}", path.display()))?;
    eprintln!("Created config file: {}", path.display());
    Ok(())
}

fn validate_args(args: &Args) -> Result<()> {
    if args.in_place && args.input.is_none() {
        return Err(ArgError("--in-place requires an input file".to_string()).into());
    }

    if args.watch && args.input.is_none() {
        return Err(ArgError("--watch requires an input file".to_string()).into());
    }

    if args.linter.trim().is_empty() {
        return Err(ArgError("--linter must not be empty".to_string()).into());
    }

    if args.formatter.trim().is_empty() {
        return Err(ArgError("--formatter must not be empty".to_string()).into());
    }

    Ok(())
}

/// Statistics collected during one pipeline run
#[derive(Debug, Default, Clone)]
struct Stats {
    /// Number of diagnostics parsed from the linter output
    diagnostics: usize,
    /// Number of lines with an undefined-variable diagnostic
    undefined_names: usize,
    /// Number of names the file defines
    known_symbols: usize,
    /// Number of substitutions made
    fixes_applied: usize,
    /// Undefined names left alone (no close candidate or no match on the line)
    fixes_skipped: usize,
    /// Corrected lines flagged as changed
    lines_changed: usize,
    /// Lines in the original source
    total_lines: usize,
    /// Processing elapsed time
    elapsed: Duration,
}

impl Stats {
    /// Calculate lines processed per second
    fn lines_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total_lines as f64 / secs
        } else {
            self.total_lines as f64
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Diagnostic Extraction
// ─────────────────────────────────────────────────────────────────────────────

/// `<file>:<line>:<column>: <code>: <message>`, anchored at line start only
static DIAGNOSTIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<file>.+?):(?P<line>\d+):\d+: (?P<code>[A-Z]\d+): (?P<msg>.+)")
        .expect("diagnostic pattern compiles")
});

static QUOTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'(.*?)'").expect("quoted pattern compiles"));

/// Message marker for findings about names that resolve nowhere
const UNDEFINED_VARIABLE_MARKER: &str = "undefined-variable";

/// One linter finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct Diagnostic {
    /// 1-indexed line the finding points at
    line: usize,
    /// Short category token such as `E0602`
    code: String,
    message: String,
}

/// Everything extracted from one linter run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct LintReport {
    diagnostics: Vec<Diagnostic>,
    /// Line → undefined name. One entry per line; the last finding wins.
    undefined: BTreeMap<usize, String>,
}

impl LintReport {
    /// Lines with findings, in report order
    fn error_lines(&self) -> Vec<usize> {
        self.diagnostics.iter().map(|d| d.line).collect()
    }

    /// `Line N: message` strings, in report order
    fn messages(&self) -> Vec<String> {
        self.diagnostics
            .iter()
            .map(|d| format!("Line {}: {}", d.line, d.message))
            .collect()
    }

    fn is_clean(&self) -> bool {
        self.diagnostics.is_empty() && self.undefined.is_empty()
    }
}

/// First non-empty single-quoted substring of a message
fn first_quoted(message: &str) -> Option<&str> {
    QUOTED_RE
        .captures(message)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .filter(|name| !name.is_empty())
}

/// Parse linter output into a report. Lines that do not look like a finding
/// are skipped; this never fails.
fn parse_lint_output(output: &str) -> LintReport {
    let mut report = LintReport::default();

    for raw in output.lines() {
        let Some(caps) = DIAGNOSTIC_RE.captures(raw) else {
            continue;
        };

        let line = match caps["line"].parse::<usize>() {
            Ok(line) if line > 0 => line,
            _ => continue,
        };

        let message = caps["msg"].to_string();
        if message.contains(UNDEFINED_VARIABLE_MARKER) {
            if let Some(name) = first_quoted(&message) {
                report.undefined.insert(line, name.to_string());
            }
        }

        report.diagnostics.push(Diagnostic {
            line,
            code: caps["code"].to_string(),
            message,
        });
    }

    report
}

// ─────────────────────────────────────────────────────────────────────────────
// Python Syntax
// ─────────────────────────────────────────────────────────────────────────────

fn parse_python(source: &str) -> Result<Tree> {
    let mut parser = tree_sitter::Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .context("Failed to load the Python grammar")?;

    parser
        .parse(source, None)
        .ok_or_else(|| anyhow::anyhow!("Python parser returned no syntax tree"))
}

fn syntax_error_at(node: Node<'_>, message: impl Into<String>) -> SyntaxError {
    let position = node.start_position();
    SyntaxError {
        line: position.row + 1,
        column: position.column + 1,
        message: message.into(),
    }
}

/// Locate the first syntax error in document order: an error or missing
/// node, or a construct the grammar tolerates but Python 3 rejects.
fn first_syntax_error(tree: &Tree) -> Option<SyntaxError> {
    let root = tree.root_node();
    let mut stack = vec![root];

    while let Some(node) = stack.pop() {
        if node.is_missing() {
            return Some(syntax_error_at(node, format!("expected '{}'", node.kind())));
        }
        if node.is_error() {
            return Some(syntax_error_at(node, "invalid syntax"));
        }
        if let Some(err) = python3_violation(node) {
            return Some(err);
        }

        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        stack.extend(children.into_iter().rev());
    }

    root.has_error().then(|| syntax_error_at(root, "invalid syntax"))
}

/// tree-sitter-python still accepts a few Python 2 forms and leaves some
/// checks that CPython's parser makes to the compiler
fn python3_violation(node: Node<'_>) -> Option<SyntaxError> {
    match node.kind() {
        "print_statement" => Some(syntax_error_at(
            node,
            "Missing parentheses in call to 'print'",
        )),
        "exec_statement" => Some(syntax_error_at(
            node,
            "Missing parentheses in call to 'exec'",
        )),
        "<>" if !node.is_named() => Some(syntax_error_at(node, "invalid syntax ('<>')")),
        "module" | "block" => indentation_violation(node),
        "parameters" | "lambda_parameters" => parameter_order_violation(node),
        "argument_list" => argument_order_violation(node),
        "for_in_clause" => comprehension_tuple_violation(node),
        _ => None,
    }
}

/// Statements that start a line must share one column: 0 in a module, the
/// first statement's column in a block
fn indentation_violation(body: Node<'_>) -> Option<SyntaxError> {
    let mut expected = (body.kind() == "module").then_some(0);
    let mut previous_end_row: Option<usize> = None;
    let mut cursor = body.walk();

    for statement in body.named_children(&mut cursor) {
        if matches!(statement.kind(), "comment" | "line_continuation") {
            continue;
        }

        let start = statement.start_position();
        let starts_line = previous_end_row.is_none_or(|row| start.row > row);
        previous_end_row = Some(statement.end_position().row);
        if !starts_line {
            continue;
        }

        match expected {
            None => expected = Some(start.column),
            Some(column) if start.column > column => {
                return Some(syntax_error_at(statement, "unexpected indent"));
            }
            Some(column) if start.column < column => {
                return Some(syntax_error_at(
                    statement,
                    "unindent does not match any outer indentation level",
                ));
            }
            Some(_) => {}
        }
    }

    None
}

/// `*args: int` and `**kw: str` parse as typed parameters around a splat
fn is_typed_splat(param: Node<'_>) -> bool {
    let mut cursor = param.walk();
    let first = param.named_children(&mut cursor).next();
    first.is_some_and(|inner| inner.kind() != "identifier")
}

/// Defaults must run to the end of the positional parameters
fn parameter_order_violation(parameters: Node<'_>) -> Option<SyntaxError> {
    let mut seen_default = false;
    let mut cursor = parameters.walk();

    for param in parameters.named_children(&mut cursor) {
        match param.kind() {
            "keyword_separator" | "list_splat_pattern" | "dictionary_splat_pattern" => break,
            "typed_parameter" if is_typed_splat(param) => break,
            "default_parameter" | "typed_default_parameter" => seen_default = true,
            "identifier" | "typed_parameter" if seen_default => {
                return Some(syntax_error_at(
                    param,
                    "non-default argument follows default argument",
                ));
            }
            // Python 2 tuple parameters: `def f((a, b)):`
            "tuple_pattern" => return Some(syntax_error_at(param, "invalid syntax")),
            _ => {}
        }
    }

    None
}

fn argument_order_violation(arguments: Node<'_>) -> Option<SyntaxError> {
    let mut seen_keyword = false;
    let mut seen_mapping_unpack = false;
    let mut cursor = arguments.walk();

    for argument in arguments.named_children(&mut cursor) {
        let message = match argument.kind() {
            "comment" => continue,
            "keyword_argument" => {
                seen_keyword = true;
                continue;
            }
            "dictionary_splat" => {
                seen_mapping_unpack = true;
                continue;
            }
            "list_splat" if seen_mapping_unpack => {
                "iterable argument unpacking follows keyword argument unpacking"
            }
            "list_splat" => continue,
            _ if seen_mapping_unpack => "positional argument follows keyword argument unpacking",
            _ if seen_keyword => "positional argument follows keyword argument",
            _ => continue,
        };
        return Some(syntax_error_at(argument, message));
    }

    None
}

/// `[a for a in b, c]` was Python 2; Python 3 needs `(b, c)`
fn comprehension_tuple_violation(clause: Node<'_>) -> Option<SyntaxError> {
    let mut cursor = clause.walk();
    let comma = clause.children(&mut cursor).find(|child| child.kind() == ",");
    comma.map(|comma| syntax_error_at(comma, "invalid syntax"))
}

/// Parse the source, failing with [`SyntaxError`] if it is not valid Python
fn check_syntax(source: &str) -> Result<Tree> {
    let tree = parse_python(source)?;
    if let Some(err) = first_syntax_error(&tree) {
        return Err(err.into());
    }
    Ok(tree)
}

fn node_text<'s>(node: Node<'_>, source: &'s [u8]) -> Option<&'s str> {
    node.utf8_text(source).ok()
}

fn is_async_def(function: Node<'_>) -> bool {
    let mut cursor = function.walk();
    let is_async = function
        .children(&mut cursor)
        .any(|child| child.kind() == "async");
    is_async
}

/// True when the nearest enclosing scope of `node` is a class body
fn in_class_body(node: Node<'_>) -> bool {
    let mut current = node.parent();
    while let Some(scope) = current {
        match scope.kind() {
            "class_definition" => return true,
            "function_definition" | "lambda" => return false,
            _ => current = scope.parent(),
        }
    }
    false
}

/// Positional-or-keyword parameter names of a `parameters` node.
/// Names before `/` are positional-only and names after `*` or `*args`
/// are keyword-only; neither is collected.
fn positional_parameters(parameters: Node<'_>, source: &[u8]) -> Vec<String> {
    let mut names = Vec::new();
    let mut cursor = parameters.walk();

    for param in parameters.named_children(&mut cursor) {
        let name = match param.kind() {
            "positional_separator" => {
                names.clear();
                continue;
            }
            "keyword_separator" | "list_splat_pattern" | "dictionary_splat_pattern" => break,
            "identifier" => Some(param),
            "default_parameter" | "typed_default_parameter" => param
                .child_by_field_name("name")
                .filter(|name| name.kind() == "identifier"),
            "typed_parameter" if is_typed_splat(param) => break,
            "typed_parameter" => {
                let mut inner = param.walk();
                let name = param.named_children(&mut inner).next();
                name
            }
            _ => None,
        };

        if let Some(text) = name.and_then(|n| node_text(n, source)) {
            names.push(text.to_string());
        }
    }

    names
}

/// Collect the flat set of names the file defines: positional parameters of
/// every plain `def` and every bare-name assignment target outside class
/// bodies. Scope is ignored.
fn collect_known_symbols(tree: &Tree, source: &str) -> BTreeSet<String> {
    let bytes = source.as_bytes();
    let mut symbols = BTreeSet::new();
    let mut stack = vec![tree.root_node()];

    while let Some(node) = stack.pop() {
        match node.kind() {
            "function_definition" if !is_async_def(node) => {
                if let Some(parameters) = node.child_by_field_name("parameters") {
                    symbols.extend(positional_parameters(parameters, bytes));
                }
            }
            // `x: int = 1` carries a type and is not a plain assignment
            "assignment"
                if node.child_by_field_name("type").is_none() && !in_class_body(node) =>
            {
                let target = node
                    .child_by_field_name("left")
                    .filter(|left| left.kind() == "identifier");
                if let Some(name) = target.and_then(|t| node_text(t, bytes)) {
                    symbols.insert(name.to_string());
                }
            }
            _ => {}
        }

        let mut cursor = node.walk();
        stack.extend(node.named_children(&mut cursor));
    }

    symbols
}

// ─────────────────────────────────────────────────────────────────────────────
// Repair
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RepairOptions {
    max_distance: usize,
    mode: ReplaceMode,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            max_distance: DEFAULT_MAX_DISTANCE,
            mode: ReplaceMode::Substring,
        }
    }
}

/// One substitution made by the repair step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct AppliedFix {
    line: usize,
    from: String,
    to: String,
    distance: usize,
}

impl fmt::Display for AppliedFix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Fixing '{}' to '{}' on line {}",
            self.from, self.to, self.line
        )
    }
}

/// Nearest known symbol by Levenshtein distance. Ties go to the
/// lexicographically smallest candidate.
fn closest_symbol<'a>(name: &str, known: &'a BTreeSet<String>) -> Option<(&'a str, usize)> {
    let mut best: Option<(&'a str, usize)> = None;

    for candidate in known {
        let distance = strsim::levenshtein(name, candidate);
        if best.is_none_or(|(_, best_distance)| distance < best_distance) {
            best = Some((candidate.as_str(), distance));
        }
    }

    best
}

/// Replace the first occurrence of `from` in `line`, or `None` if absent
fn replace_first(line: &str, from: &str, to: &str, mode: ReplaceMode) -> Option<String> {
    match mode {
        ReplaceMode::Substring => line.contains(from).then(|| line.replacen(from, to, 1)),
        ReplaceMode::Identifier => {
            let pattern = Regex::new(&format!(r"\b{}\b", regex::escape(from))).ok()?;
            pattern
                .is_match(line)
                .then(|| pattern.replacen(line, 1, NoExpand(to)).into_owned())
        }
    }
}

/// Substitute every undefined name with its closest known symbol, one line
/// at a time. Lines without a close enough candidate are left untouched.
fn repair_undefined_names(
    source: &str,
    undefined: &BTreeMap<usize, String>,
    known: &BTreeSet<String>,
    options: RepairOptions,
) -> (String, Vec<AppliedFix>) {
    let mut lines: Vec<String> = source.split('\n').map(String::from).collect();
    let mut fixes = Vec::new();

    for (&line_num, name) in undefined {
        let Some((candidate, distance)) = closest_symbol(name, known) else {
            continue;
        };
        if distance > options.max_distance || candidate == name.as_str() {
            continue;
        }

        let Some(line) = line_num.checked_sub(1).and_then(|idx| lines.get_mut(idx)) else {
            continue;
        };

        if let Some(replaced) = replace_first(line, name, candidate, options.mode) {
            *line = replaced;
            fixes.push(AppliedFix {
                line: line_num,
                from: name.clone(),
                to: candidate.to_string(),
                distance,
            });
        }
    }

    (lines.join("\n"), fixes)
}

// ─────────────────────────────────────────────────────────────────────────────
// External Tools
// ─────────────────────────────────────────────────────────────────────────────

/// Produces raw linter output for a file on disk
trait Linter {
    fn lint(&self, path: &Path) -> Result<String>;
}

/// Normalizes source layout without changing its meaning
trait Formatter {
    fn format(&self, source: &str) -> Result<String>;
}

/// Split a command line on whitespace into program and arguments
fn split_command(command: &str, flag: &str) -> Result<(String, Vec<String>)> {
    let mut parts = command.split_whitespace().map(String::from);
    let program = parts
        .next()
        .ok_or_else(|| ArgError(format!("{} must not be empty", flag)))?;
    Ok((program, parts.collect()))
}

/// Runs a linter process; stdout and stderr are both kept and the exit
/// status is ignored (pylint exits non-zero whenever it finds anything).
struct CommandLinter {
    program: String,
    args: Vec<String>,
}

impl CommandLinter {
    fn parse(command: &str) -> Result<Self> {
        let (program, args) = split_command(command, "--linter")?;
        Ok(Self { program, args })
    }
}

impl Linter for CommandLinter {
    fn lint(&self, path: &Path) -> Result<String> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Failed to run linter `{}`", self.program))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }
}

/// Replays linter output recorded earlier
struct ReportLinter {
    output: String,
}

impl ReportLinter {
    fn load(path: &Path) -> Result<Self> {
        let output = fs::read_to_string(path)
            .with_context(|| format!("Failed to read lint report: {}", path.display()))?;
        Ok(Self { output })
    }
}

impl Linter for ReportLinter {
    fn lint(&self, _path: &Path) -> Result<String> {
        Ok(self.output.clone())
    }
}

/// Pipes source through a formatter process
struct CommandFormatter {
    program: String,
    args: Vec<String>,
}

impl CommandFormatter {
    fn parse(command: &str) -> Result<Self> {
        let (program, args) = split_command(command, "--formatter")?;
        Ok(Self { program, args })
    }
}

impl Formatter for CommandFormatter {
    fn format(&self, source: &str) -> Result<String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                FormatError(format!("Failed to run formatter `{}`: {}", self.program, err))
            })?;

        // Feed stdin from another thread so a full stdout pipe cannot stall us
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| FormatError("Formatter stdin was not captured".to_string()))?;
        let input = source.to_string();
        let writer = thread::spawn(move || stdin.write_all(input.as_bytes()));

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for formatter `{}`", self.program))?;

        match writer.join() {
            Ok(Ok(())) => {}
            // The formatter may exit before reading everything; its status decides
            Ok(Err(err)) if err.kind() == io::ErrorKind::BrokenPipe => {}
            Ok(Err(err)) => {
                return Err(err).context(format!(
                    "Failed to write source to formatter `{}`",
                    self.program
                ));
            }
            Err(_) => anyhow::bail!("Formatter input thread panicked"),
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FormatError(format!(
                "Formatter `{}` failed ({}): {}",
                self.program,
                output.status,
                stderr.trim()
            ))
            .into());
        }

        String::from_utf8(output.stdout)
            .map_err(|_| FormatError(format!("Formatter `{}` wrote invalid UTF-8", self.program)))
            .map_err(Into::into)
    }
}

/// Leaves source untouched (`--no-format`)
struct IdentityFormatter;

impl Formatter for IdentityFormatter {
    fn format(&self, source: &str) -> Result<String> {
        Ok(source.to_string())
    }
}

/// The external tools one pipeline run talks to
struct Toolchain {
    linter: Box<dyn Linter + Send>,
    formatter: Box<dyn Formatter + Send>,
}

impl Toolchain {
    fn from_config(config: &Config) -> Result<Self> {
        let linter: Box<dyn Linter + Send> = match &config.lint_report {
            Some(path) => Box::new(ReportLinter::load(path)?),
            None => Box::new(CommandLinter::parse(&config.linter)?),
        };

        let formatter: Box<dyn Formatter + Send> = if config.format {
            Box::new(CommandFormatter::parse(&config.formatter)?)
        } else {
            Box::new(IdentityFormatter)
        };

        Ok(Self { linter, formatter })
    }
}

/// Format repaired code. Unparseable input is rejected before the formatter
/// ever sees it.
fn format_source(source: &str, formatter: &dyn Formatter) -> Result<String> {
    let tree = parse_python(source)?;
    if let Some(err) = first_syntax_error(&tree) {
        return Err(FormatError(format!("Repaired code does not parse: {}", err)).into());
    }
    formatter.format(source)
}

// ─────────────────────────────────────────────────────────────────────────────
// Diff Rendering
// ─────────────────────────────────────────────────────────────────────────────

/// One line of corrected output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct DiffLine {
    text: String,
    changed: bool,
}

/// Flag corrected lines that differ from the original. Only the ends of the
/// whole texts are trimmed before splitting; each line pair is compared
/// trimmed.
fn render_diff(original: &str, corrected: &str, mode: DiffMode) -> Vec<DiffLine> {
    let original_lines: Vec<&str> = original.trim().split('\n').collect();
    let corrected_lines: Vec<&str> = corrected.trim().split('\n').collect();

    match mode {
        DiffMode::Positional => positional_diff(&original_lines, &corrected_lines),
        DiffMode::Aligned => aligned_diff(&original_lines, &corrected_lines),
    }
}

/// Index-by-index comparison. An inserted or deleted line marks every line
/// after it as changed.
fn positional_diff(original: &[&str], corrected: &[&str]) -> Vec<DiffLine> {
    corrected
        .iter()
        .enumerate()
        .map(|(idx, line)| DiffLine {
            text: line.to_string(),
            changed: original
                .get(idx)
                .is_none_or(|before| before.trim() != line.trim()),
        })
        .collect()
}

fn aligned_diff(original: &[&str], corrected: &[&str]) -> Vec<DiffLine> {
    let old: Vec<&str> = original.iter().map(|line| line.trim()).collect();
    let new: Vec<&str> = corrected.iter().map(|line| line.trim()).collect();
    let mut changed = vec![true; corrected.len()];

    for op in similar::capture_diff_slices(Algorithm::Myers, &old, &new) {
        if let DiffOp::Equal { new_index, len, .. } = op {
            for flag in &mut changed[new_index..new_index + len] {
                *flag = false;
            }
        }
    }

    corrected
        .iter()
        .zip(changed)
        .map(|(line, changed)| DiffLine {
            text: line.to_string(),
            changed,
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct PipelineOptions {
    repair: RepairOptions,
    diff_mode: DiffMode,
}

/// Result of one successful pipeline run
#[derive(Debug, Clone)]
struct Analysis {
    report: LintReport,
    known_symbols: BTreeSet<String>,
    fixes: Vec<AppliedFix>,
    corrected: String,
    diff: Vec<DiffLine>,
    /// Non-fatal problems, such as a linter that could not be started
    warnings: Vec<String>,
    stats: Stats,
}

impl Analysis {
    fn changed_lines(&self) -> Vec<usize> {
        self.diff
            .iter()
            .enumerate()
            .filter(|(_, line)| line.changed)
            .map(|(idx, _)| idx + 1)
            .collect()
    }
}

/// Run syntax check, lint, repair, format and diff for one source snapshot.
/// A syntax error stops the run before the linter is invoked.
fn run_pipeline(
    source: &str,
    path: &Path,
    toolchain: &Toolchain,
    options: PipelineOptions,
) -> Result<Analysis> {
    let start_time = Instant::now();
    let tree = check_syntax(source)?;
    let known_symbols = collect_known_symbols(&tree, source);

    let mut warnings = Vec::new();
    let lint_output = match toolchain.linter.lint(path) {
        Ok(output) => output,
        Err(err) => {
            warnings.push(format!(
                "Linter unavailable, continuing without diagnostics: {:#}",
                err
            ));
            String::new()
        }
    };
    let report = parse_lint_output(&lint_output);

    let (repaired, fixes) =
        repair_undefined_names(source, &report.undefined, &known_symbols, options.repair);
    let corrected = format_source(&repaired, &*toolchain.formatter)?;
    let diff = render_diff(source, &corrected, options.diff_mode);

    let stats = Stats {
        diagnostics: report.diagnostics.len(),
        undefined_names: report.undefined.len(),
        known_symbols: known_symbols.len(),
        fixes_applied: fixes.len(),
        fixes_skipped: report.undefined.len().saturating_sub(fixes.len()),
        lines_changed: diff.iter().filter(|line| line.changed).count(),
        total_lines: source.lines().count(),
        elapsed: start_time.elapsed(),
    };

    Ok(Analysis {
        report,
        known_symbols,
        fixes,
        corrected,
        diff,
        warnings,
        stats,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// State shared by the load, render and save handlers
#[derive(Debug, Default)]
struct Session {
    path: Option<PathBuf>,
    original: Option<String>,
    analysis: Option<Analysis>,
    syntax_error: Option<SyntaxError>,
}

impl Session {
    /// Read a file and run the pipeline on it
    fn load(&mut self, path: &Path, toolchain: &Toolchain, options: PipelineOptions) -> Result<()> {
        let source = read_file(path)?;
        let result = run_pipeline(&source, path, toolchain, options);
        self.apply(path, source, result)
    }

    /// Record a pipeline result. A syntax error replaces the original and
    /// clears the corrected code; any other error keeps the previous state.
    fn apply(&mut self, path: &Path, source: String, result: Result<Analysis>) -> Result<()> {
        match result {
            Ok(analysis) => {
                self.path = Some(path.to_path_buf());
                self.original = Some(source);
                self.analysis = Some(analysis);
                self.syntax_error = None;
                Ok(())
            }
            Err(err) => {
                if let Some(syntax) = err.downcast_ref::<SyntaxError>() {
                    self.path = Some(path.to_path_buf());
                    self.original = Some(source);
                    self.analysis = None;
                    self.syntax_error = Some(syntax.clone());
                }
                Err(err)
            }
        }
    }

    fn corrected(&self) -> Option<&str> {
        self.analysis.as_ref().map(|a| a.corrected.as_str())
    }

    fn would_change(&self) -> bool {
        match (self.original.as_deref(), self.corrected()) {
            (Some(original), Some(corrected)) => original != corrected,
            _ => false,
        }
    }

    /// Write the corrected code to `dest`. Returns false (after a warning)
    /// when there is nothing to save yet.
    fn save(&self, dest: &Path) -> Result<bool> {
        let Some(corrected) = self.corrected() else {
            eprintln!("Warning: No corrected code available yet.");
            return Ok(false);
        };

        fs::write(dest, corrected)
            .with_context(|| format!("Failed to write to file: {}", dest.display()))?;
        Ok(true)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Input
// ─────────────────────────────────────────────────────────────────────────────

/// Creates a backup of the file by appending the extension to the filename.
/// For example: "script.py" with extension ".bak" becomes "script.py.bak"
fn create_backup(path: &Path, ext: &str) -> Result<PathBuf> {
    let mut backup_name = path.as_os_str().to_owned();
    backup_name.push(ext);
    let backup_path = PathBuf::from(backup_name);

    fs::copy(path, &backup_path)
        .with_context(|| format!("Failed to create backup at {}", backup_path.display()))?;

    Ok(backup_path)
}

/// Maximum file size (100 MB) - reject larger files to prevent memory issues
const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Read a source file as text
fn read_file(path: &Path) -> Result<String> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("Failed to read file metadata: {}", path.display()))?;

    if metadata.len() > MAX_FILE_SIZE {
        return Err(ParseError(format!(
            "File too large: {} ({} MB). Maximum supported size is {} MB.",
            path.display(),
            metadata.len() / (1024 * 1024),
            MAX_FILE_SIZE / (1024 * 1024)
        ))
        .into());
    }

    let source_label = path.display().to_string();
    let bytes =
        fs::read(path).with_context(|| format!("Failed to read input file: {}", path.display()))?;

    parse_bytes_to_text(bytes, &source_label)
}

/// Convert raw bytes to text, checking for binary content and valid UTF-8
fn parse_bytes_to_text(bytes: Vec<u8>, source_label: &str) -> Result<String> {
    if bytes.contains(&0) {
        return Err(ParseError(format!("Input appears to be binary: {}", source_label)).into());
    }

    String::from_utf8(bytes).map_err(|err| {
        let utf8_err = err.utf8_error();
        let valid_up_to = utf8_err.valid_up_to();
        let byte = err.as_bytes().get(valid_up_to).copied();
        let detail = match byte {
            Some(b) => format!(
                "Invalid UTF-8 at byte position {} (byte value: 0x{:02X}) in {}",
                valid_up_to, b, source_label
            ),
            None => format!("Invalid UTF-8 in {}", source_label),
        };
        ParseError(detail).into()
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct JsonOutput {
    version: &'static str,
    status: &'static str,
    file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    diagnostics: Vec<Diagnostic>,
    undefined: BTreeMap<usize, String>,
    known_symbols: Vec<String>,
    fixes: Vec<AppliedFix>,
    changed_lines: Vec<usize>,
    /// Non-fatal problems, such as a linter that could not be started
    warnings: Vec<String>,
    input: InputStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<OutputStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

#[derive(Serialize)]
struct InputStats {
    lines: usize,
    bytes: usize,
}

#[derive(Serialize)]
struct OutputStats {
    lines: usize,
    bytes: usize,
    changed: bool,
}

fn build_json_output(session: &Session, config: &Config) -> JsonOutput {
    let original = session.original.as_deref().unwrap_or_default();
    let file = session
        .path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    let input = InputStats {
        lines: original.lines().count(),
        bytes: original.len(),
    };

    let Some(analysis) = session.analysis.as_ref() else {
        return JsonOutput {
            version: "1.0",
            status: "syntax_error",
            file,
            error: session.syntax_error.as_ref().map(|e| e.to_string()),
            diagnostics: Vec::new(),
            undefined: BTreeMap::new(),
            known_symbols: Vec::new(),
            fixes: Vec::new(),
            changed_lines: Vec::new(),
            warnings: Vec::new(),
            input,
            output: None,
            content: None,
        };
    };

    JsonOutput {
        version: "1.0",
        status: if config.dry_run { "dry_run" } else { "success" },
        file,
        error: None,
        diagnostics: analysis.report.diagnostics.clone(),
        undefined: analysis.report.undefined.clone(),
        known_symbols: analysis.known_symbols.iter().cloned().collect(),
        fixes: analysis.fixes.clone(),
        changed_lines: analysis.changed_lines(),
        warnings: analysis.warnings.clone(),
        input,
        output: Some(OutputStats {
            lines: analysis.corrected.lines().count(),
            bytes: analysis.corrected.len(),
            changed: session.would_change(),
        }),
        content: Some(analysis.corrected.clone()),
    }
}

fn output_json(session: &Session, config: &Config) -> Result<()> {
    let json_output = build_json_output(session, config);
    println!(
        "{}",
        serde_json::to_string_pretty(&json_output).context("Failed to serialize JSON output")?
    );
    Ok(())
}

/// Output a unified diff of original against corrected code
fn output_diff(filename: &str, original: &str, corrected: &str, proposed: bool) -> Result<()> {
    if original == corrected {
        return Ok(());
    }

    let diff = TextDiff::from_lines(original, corrected);
    let mut stdout = io::stdout().lock();

    writeln!(stdout, "--- a/{}", filename)?;
    if proposed {
        writeln!(stdout, "+++ b/{} (proposed)", filename)?;
    } else {
        writeln!(stdout, "+++ b/{}", filename)?;
    }

    for hunk in diff.unified_diff().context_radius(3).iter_hunks() {
        writeln!(stdout, "{}", hunk.header())?;
        for change in hunk.iter_changes() {
            let sign = match change.tag() {
                ChangeTag::Delete => "-",
                ChangeTag::Insert => "+",
                ChangeTag::Equal => " ",
            };
            let line = change.value();
            if line.ends_with('\n') {
                write!(stdout, "{}{}", sign, line)?;
            } else {
                writeln!(stdout, "{}{}", sign, line)?;
            }
        }
    }

    Ok(())
}

/// Print one line of report text, styled only when color is on
fn print_report_line(console: &Console, styles: &VerboseStyle, tag: Option<&str>, text: &str) {
    if styles.use_color {
        let escaped = escape_markup(text);
        match tag {
            Some(tag) => console.print(&styles.wrap(tag, escaped)),
            None => console.print(&escaped),
        }
    } else {
        println!("{}", text);
    }
}

fn print_pane_header(console: &Console, styles: &VerboseStyle, title: &str) {
    if styles.use_color {
        console.print(&styles.header(format!("─── {} ───", escape_markup(title))));
    } else {
        println!("─── {} ───", title);
    }
}

/// Gutter marker for a code line: `!` linter finding, `~` changed
fn code_line(line_num: usize, marker: char, text: &str) -> String {
    format!("{:>4} {} {}", line_num, marker, text)
}

/// Render the three panes: bug summary, original code with linter lines
/// marked and corrected code with changed lines marked
fn render_report(session: &Session, console: &Console, styles: &VerboseStyle) {
    let (Some(original), Some(analysis)) = (session.original.as_deref(), &session.analysis) else {
        return;
    };
    let filename = session
        .path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    if analysis.report.is_clean() {
        print_report_line(
            console,
            styles,
            Some("bold green"),
            "No issues found. Your code looks good!",
        );
    }

    print_pane_header(console, styles, "Bug Summary");
    let messages = analysis.report.messages();
    if messages.is_empty() {
        print_report_line(console, styles, None, "No logical issues found.");
    } else {
        for message in &messages {
            print_report_line(console, styles, None, message);
        }
    }

    if !analysis.fixes.is_empty() {
        print_pane_header(console, styles, "Applied Fixes");
        for fix in &analysis.fixes {
            print_report_line(console, styles, Some("green"), &fix.to_string());
        }
    }

    print_pane_header(console, styles, &format!("Original: {}", filename));
    let error_lines: BTreeSet<usize> = analysis.report.error_lines().into_iter().collect();
    for (idx, text) in original.lines().enumerate() {
        let line_num = idx + 1;
        if error_lines.contains(&line_num) {
            print_report_line(
                console,
                styles,
                Some("bold red"),
                &code_line(line_num, '!', text),
            );
        } else {
            print_report_line(console, styles, None, &code_line(line_num, ' ', text));
        }
    }

    print_pane_header(console, styles, "Corrected");
    for (idx, line) in analysis.diff.iter().enumerate() {
        if line.changed {
            print_report_line(
                console,
                styles,
                Some("bold yellow"),
                &code_line(idx + 1, '~', &line.text),
            );
        } else {
            print_report_line(console, styles, None, &code_line(idx + 1, ' ', &line.text));
        }
    }
}

/// Verbose progress for one finished run
fn print_verbose_progress(analysis: &Analysis, console: &Console, styles: &VerboseStyle) {
    console.print(&styles.dim(format!(
        "Collected {} known symbol(s)",
        analysis.known_symbols.len()
    )));
    console.print(&styles.dim(format!(
        "Parsed {} diagnostic(s), {} undefined name(s)",
        analysis.report.diagnostics.len(),
        analysis.report.undefined.len()
    )));
    for fix in &analysis.fixes {
        console.print(&styles.success(escape_markup(&fix.to_string())));
    }
}

fn print_warnings(analysis: &Analysis, console: &Console, styles: &VerboseStyle) {
    for warning in &analysis.warnings {
        if styles.use_color {
            console.print(&styles.warning(format!("Warning: {}", escape_markup(warning))));
        } else {
            eprintln!("Warning: {}", warning);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Watch Mode
// ─────────────────────────────────────────────────────────────────────────────

/// What the worker thread sends back: the text it read and the pipeline result
type WorkerResult = Result<(String, Result<Analysis>)>;

/// Run pipelines on a background thread so the watch loop stays responsive.
/// Each path received on the returned sender produces one result.
fn spawn_pipeline_worker(
    toolchain: Toolchain,
    options: PipelineOptions,
) -> (mpsc::Sender<PathBuf>, mpsc::Receiver<WorkerResult>) {
    let (job_tx, job_rx) = mpsc::channel::<PathBuf>();
    let (result_tx, result_rx) = mpsc::channel::<WorkerResult>();

    thread::spawn(move || {
        for path in job_rx {
            let result = read_file(&path).map(|source| {
                let analysis = run_pipeline(&source, &path, &toolchain, options);
                (source, analysis)
            });
            if result_tx.send(result).is_err() {
                break;
            }
        }
    });

    (job_tx, result_rx)
}

/// Flag cleared by Ctrl+C
fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let handle = Arc::clone(&running);
    ctrlc::set_handler(move || handle.store(false, Ordering::SeqCst))
        .context("Failed to set Ctrl+C handler")?;
    Ok(running)
}

/// Start watching `path`. Only writes and re-creations reach the receiver;
/// the watcher stops when the returned handle is dropped.
fn watch_for_saves(path: &Path) -> Result<(RecommendedWatcher, mpsc::Receiver<()>)> {
    let (tx, rx) = mpsc::channel();
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            let saved = res
                .is_ok_and(|event| matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)));
            if saved {
                let _ = tx.send(());
            }
        },
        notify::Config::default(),
    )
    .context("Failed to create file watcher")?;

    watcher
        .watch(path, RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch file: {}", path.display()))?;
    Ok((watcher, rx))
}

/// Apply one worker result to the session, render it and save it to `output`
fn report_watch_result(
    session: &mut Session,
    path: &Path,
    result: WorkerResult,
    output: Option<&Path>,
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
) {
    let applied = result
        .context("Error reading file")
        .and_then(|(source, analysis)| session.apply(path, source, analysis));
    if let Err(e) = applied {
        eprintln!("✗ {:#}", e);
        return;
    }

    if let Some(analysis) = &session.analysis {
        print_warnings(analysis, console, styles);
        if config.verbose {
            print_verbose_progress(analysis, console, styles);
        }
    }
    render_report(session, console, styles);

    if let Some(dest) = output {
        match session.save(dest) {
            Ok(true) => eprintln!("✓ Saved to {}", dest.display()),
            Ok(false) => {}
            Err(e) => eprintln!("✗ Failed to save: {:#}", e),
        }
    }
}

/// Watch a file and re-run the fixer on each save. At most one pipeline run
/// is in flight; saves that arrive meanwhile queue a single rerun.
fn watch_and_report(
    path: &Path,
    output: Option<&Path>,
    config: &Config,
    toolchain: Toolchain,
    console: &Console,
    styles: &VerboseStyle,
) -> Result<RunOutcome> {
    if !path.is_file() {
        anyhow::bail!("--watch requires an existing file: {}", path.display());
    }

    let running = interrupt_flag()?;
    let (_watcher, saves) = watch_for_saves(path)?;
    let (job_tx, result_rx) = spawn_pipeline_worker(toolchain, config.pipeline_options());

    let debounce = Duration::from_millis(config.debounce_ms);
    let mut last_save: Option<Instant> = None;
    let mut session = Session::default();
    let mut in_flight = false;
    let mut rerun = true;
    let mut any_changes = false;

    eprintln!("Watching {} for changes (Ctrl+C to stop)...", path.display());

    while running.load(Ordering::SeqCst) {
        if rerun && !in_flight {
            if job_tx.send(path.to_path_buf()).is_err() {
                break;
            }
            in_flight = true;
            rerun = false;
        }

        match result_rx.try_recv() {
            Ok(result) => {
                in_flight = false;
                report_watch_result(&mut session, path, result, output, config, console, styles);
                any_changes |= session.would_change();
            }
            Err(mpsc::TryRecvError::Empty) => {}
            Err(mpsc::TryRecvError::Disconnected) => break,
        }

        match saves.recv_timeout(Duration::from_millis(100)) {
            Ok(()) => {
                let now = Instant::now();
                if last_save.is_none_or(|last| now.duration_since(last) >= debounce) {
                    last_save = Some(now);
                    rerun = true;
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    eprintln!("\nWatch mode stopped.");

    Ok(RunOutcome {
        dry_run: false,
        would_change: any_changes,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Entry Point
// ─────────────────────────────────────────────────────────────────────────────

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => exit_codes::SUCCESS,
                _ => exit_codes::INVALID_ARGS,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    if let Some(Commands::Config { action }) = &args.command {
        let exit_code = match run_config_command(action) {
            Ok(()) => exit_codes::SUCCESS,
            Err(err) => {
                eprintln!("Error: {:#}", err);
                exit_code_for_error(&err)
            }
        };
        std::process::exit(exit_code);
    }

    let exit_code = match run(args) {
        Ok(outcome) => {
            if outcome.dry_run && outcome.would_change {
                exit_codes::WOULD_CHANGE
            } else {
                exit_codes::SUCCESS
            }
        }
        Err(err) => {
            eprintln!("Error: {:#}", err);
            exit_code_for_error(&err)
        }
    };

    std::process::exit(exit_code);
}

fn run(args: Args) -> Result<RunOutcome> {
    validate_args(&args)?;

    let config = create_config(&args)?;
    let (console, styles) = build_console(config.color);

    let Some(path) = args.input.as_deref() else {
        eprintln!("Warning: No file was selected.");
        return Ok(RunOutcome {
            dry_run: config.dry_run,
            would_change: false,
        });
    };

    let toolchain = Toolchain::from_config(&config)?;

    if config.watch {
        return watch_and_report(
            path,
            args.output.as_deref(),
            &config,
            toolchain,
            &console,
            &styles,
        );
    }

    if config.verbose {
        console.print(&styles.bold(format!("Processing {}...", path.display())));
    }

    let mut session = Session::default();
    if let Err(err) = session.load(path, &toolchain, config.pipeline_options()) {
        if config.json && session.syntax_error.is_some() {
            output_json(&session, &config)?;
        }
        return Err(err);
    }

    output_session(&args, &config, &console, &styles, &session)
}

/// Display the loaded session and perform the requested save
fn output_session(
    args: &Args,
    config: &Config,
    console: &Console,
    styles: &VerboseStyle,
    session: &Session,
) -> Result<RunOutcome> {
    let Some(analysis) = session.analysis.as_ref() else {
        anyhow::bail!("No analysis available");
    };
    let original = session.original.as_deref().unwrap_or_default();
    let filename = session
        .path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let would_change = session.would_change();

    if !config.json {
        print_warnings(analysis, console, styles);
        if config.verbose {
            print_verbose_progress(analysis, console, styles);
        }
    }

    if config.json {
        output_json(session, config)?;
    } else if config.diff {
        output_diff(&filename, original, &analysis.corrected, config.dry_run)?;
    } else if config.corrected {
        print!("{}", analysis.corrected);
        io::stdout().flush()?;
    } else {
        render_report(session, console, styles);
    }

    if !config.dry_run {
        if let Some(dest) = args.output.as_deref() {
            if session.save(dest)? && config.verbose {
                console.print(&styles.success(format!("Saved to {}", dest.display())));
            }
        } else if args.in_place {
            let path = args
                .input
                .as_deref()
                .ok_or_else(|| ArgError("--in-place requires an input file".to_string()))?;

            if config.backup {
                let backup_path = create_backup(path, &config.backup_ext)?;
                if config.verbose {
                    console.print(&styles.dim(format!("Created backup: {}", backup_path.display())));
                }
            }

            session.save(path)?;
        }
    }

    if config.verbose {
        print_stats_summary(&analysis.stats, console, styles);
    }

    Ok(RunOutcome {
        dry_run: config.dry_run,
        would_change,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
