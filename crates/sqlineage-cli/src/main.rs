use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sqlineage_core::{Config, LineageError, Schema};
use sqlineage_engine::{diff, impact, trace, DiffOptions, ImpactOptions, LineageQuery, TraceOptions};
use sqlineage_sql::{analyze, extract_tables, list_ctes, qualify_report, AnalyzeOptions, ParsedSql, SqlParser};

mod render;

/// sqlineage - column-level lineage for SQL queries
#[derive(Parser)]
#[command(name = "sqlineage")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: sqlineage.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// SQL dialect (ansi, bigquery, snowflake, postgres, redshift, mysql)
    #[arg(short, long, global = true)]
    dialect: Option<String>,

    /// Table schema as JSON, or @path to a JSON file
    #[arg(short, long, global = true)]
    schema: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Trace a column back to its source tables
    Trace(TraceArgs),

    /// Find every column that depends on a source column
    Impact(ImpactArgs),

    /// Compare the impact of a source column across two query versions
    Diff(DiffArgs),

    /// Describe tables, CTEs, output columns, joins and filters
    Analyze(AnalyzeArgs),

    /// List CTEs with their columns and references
    Ctes(CtesArgs),

    /// List the physical tables a query reads
    Tables(TablesArgs),

    /// Show how each column reference was qualified
    Qualify(QualifyArgs),
}

#[derive(Args)]
struct TraceArgs {
    /// SQL text, or @path to a SQL file
    sql: String,

    /// Output column to trace (optionally table- or CTE-qualified)
    #[arg(short, long)]
    column: String,

    #[arg(short, long, value_enum, default_value = "json")]
    format: TraceFormat,

    /// Only include nodes up to this depth
    #[arg(long)]
    depth: Option<usize>,

    /// Truncate expressions to this many characters
    #[arg(short, long)]
    max_expr_length: Option<usize>,

    /// Include full lineage for columns found only inside CTEs
    #[arg(long)]
    recurse_ctes: bool,

    /// Write output to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct ImpactArgs {
    /// SQL text, or @path to a SQL file
    sql: String,

    /// Source column, e.g. orders.amount
    #[arg(short = 'c', long)]
    source_column: String,

    #[arg(short, long, value_enum, default_value = "json")]
    format: ReportFormat,

    #[arg(long)]
    max_expr_length: Option<usize>,

    /// Keep at most this many available source columns in the report
    #[arg(long)]
    max_sources: Option<usize>,

    /// Omit expressions from impacted columns
    #[arg(long)]
    summary_only: bool,

    /// Attach approximate line numbers for CTEs and the final SELECT
    #[arg(long)]
    include_line_numbers: bool,

    /// Attach the impact graph
    #[arg(long)]
    include_graph: bool,

    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct DiffArgs {
    /// Old SQL text, or @path
    old: String,

    /// New SQL text, or @path
    new: String,

    #[arg(short = 'c', long)]
    source_column: String,

    #[arg(short, long, value_enum, default_value = "json")]
    format: ReportFormat,

    #[arg(long)]
    include_graph: bool,

    /// Rejected: a diff needs full expressions
    #[arg(long)]
    summary_only: bool,

    /// Rejected: a diff needs full expressions
    #[arg(long)]
    max_expr_length: Option<usize>,

    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct AnalyzeArgs {
    /// SQL text, or @path to a SQL file
    sql: String,

    #[arg(short, long, value_enum, default_value = "json")]
    format: AnalyzeFormat,

    #[arg(short, long)]
    max_expr_length: Option<usize>,

    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct CtesArgs {
    sql: String,

    #[arg(short, long, value_enum, default_value = "text")]
    format: TextFormat,
}

#[derive(Args)]
struct TablesArgs {
    sql: String,

    /// Print one table name per line instead of JSON
    #[arg(long)]
    names_only: bool,
}

#[derive(Args)]
struct QualifyArgs {
    sql: String,

    #[arg(short, long, value_enum, default_value = "json")]
    format: TextFormat,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TraceFormat {
    Json,
    Tree,
    Html,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReportFormat {
    Json,
    Tree,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AnalyzeFormat {
    Json,
    Markdown,
    Diagram,
    Summary,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TextFormat {
    Text,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let mut config = Config::discover(cli.config.as_deref(), Path::new("."))?;

    if let Some(dialect) = &cli.dialect {
        config.dialect = dialect.parse()?;
    }

    if let Some(schema) = &cli.schema {
        config.schema.merge(load_schema(schema)?);
    }

    if cli.verbose {
        eprintln!("{} dialect: {}", "Using".cyan(), config.dialect);
        if !config.schema.is_empty() {
            eprintln!("{} {} tables", "Schema:".cyan(), config.schema.table_names().len());
        }
    }

    let success = match cli.command {
        Commands::Trace(args) => trace_command(&config, &args, cli.verbose),
        Commands::Impact(args) => impact_command(&config, &args, cli.verbose),
        Commands::Diff(args) => diff_command(&config, &args, cli.verbose),
        Commands::Analyze(args) => analyze_command(&config, &args),
        Commands::Ctes(args) => ctes_command(&config, &args),
        Commands::Tables(args) => tables_command(&config, &args),
        Commands::Qualify(args) => qualify_command(&config, &args),
    }?;

    if !success {
        std::process::exit(1);
    }

    Ok(())
}

/// Log to stderr; RUST_LOG overrides the verbosity flag
fn init_logging(verbose: bool) {
    let default_level = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Read `@path` from disk, anything else is taken literally
fn read_input(input: &str) -> Result<String> {
    match input.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path)),
        None => Ok(input.to_string()),
    }
}

fn load_schema(input: &str) -> Result<Schema> {
    let json = read_input(input)?;
    Schema::from_json(&json).context("Invalid schema JSON")
}

fn parse(config: &Config, input: &str) -> Result<Result<ParsedSql, LineageError>> {
    let sql = read_input(input)?;
    Ok(SqlParser::from_dialect(&config.dialect).parse_lineage(&sql))
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// Print to stdout or write to `output`
fn emit(text: &str, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("{} {}", "Output saved to:".green(), path.display());
        }
        None => println!("{}", text),
    }
    Ok(())
}

/// Report an error that stopped the analysis; always unsuccessful
fn emit_error(err: &LineageError, json: bool) -> Result<bool> {
    tracing::debug!(code = %err.code(), "analysis failed: {}", err);

    if json {
        let body = serde_json::json!({
            "success": false,
            "error": err.to_string(),
            "code": err.code(),
            "hint": err.hint(),
        });
        println!("{}", to_json(&body)?);
    } else {
        eprintln!("{} {}", "Error:".red().bold(), err);
        eprintln!("{} {}", "Hint:".yellow(), err.hint());
    }

    Ok(false)
}

fn trace_command(config: &Config, args: &TraceArgs, verbose: bool) -> Result<bool> {
    let json = args.format == TraceFormat::Json;
    let parsed = match parse(config, &args.sql)? {
        Ok(parsed) => parsed,
        Err(err) => return emit_error(&err, json),
    };
    let query = match LineageQuery::from_parsed(&parsed, &config.schema) {
        Ok(query) => query,
        Err(err) => return emit_error(&err, json),
    };

    if verbose {
        eprintln!("{} {}", "Tracing column:".cyan(), args.column);
    }

    let options = TraceOptions {
        depth: args.depth,
        max_expr_length: args.max_expr_length.or(config.output.max_expr_length),
        limits: config.limits,
        recurse_ctes: args.recurse_ctes,
    };
    let result = trace(&query, &args.column, &options);

    let text = match args.format {
        TraceFormat::Json => to_json(&result)?,
        TraceFormat::Tree => render::trace_tree(&result),
        TraceFormat::Html => render::trace_html(&result),
    };
    emit(&text, args.output.as_deref())?;

    Ok(result.is_success())
}

fn impact_command(config: &Config, args: &ImpactArgs, verbose: bool) -> Result<bool> {
    let json = args.format == ReportFormat::Json;
    let parsed = match parse(config, &args.sql)? {
        Ok(parsed) => parsed,
        Err(err) => return emit_error(&err, json),
    };
    let query = match LineageQuery::from_parsed(&parsed, &config.schema) {
        Ok(query) => query,
        Err(err) => return emit_error(&err, json),
    };

    if verbose {
        eprintln!("{} {}", "Analyzing impact for:".cyan(), args.source_column);
    }

    let options = ImpactOptions {
        summary_only: args.summary_only,
        max_expr_length: args.max_expr_length.or(config.output.max_expr_length),
        max_sources: args.max_sources.or(config.output.max_sources),
        include_line_numbers: args.include_line_numbers,
        include_graph: args.include_graph,
        limits: config.limits,
    };
    let result = match impact(&query, &args.source_column, &options) {
        Ok(result) => result,
        Err(err) => return emit_error(&err, json),
    };

    let text = match args.format {
        ReportFormat::Json => to_json(&result)?,
        ReportFormat::Tree => render::impact_tree(&result),
    };
    emit(&text, args.output.as_deref())?;

    Ok(result.is_success())
}

fn diff_command(config: &Config, args: &DiffArgs, verbose: bool) -> Result<bool> {
    let json = args.format == ReportFormat::Json;

    let options = DiffOptions {
        summary_only: args.summary_only,
        max_expr_length: args.max_expr_length,
        include_graph: args.include_graph,
        limits: config.limits,
    };
    if let Err(err) = options.validate() {
        return emit_error(&err, json);
    }

    let old_parsed = match parse(config, &args.old)? {
        Ok(parsed) => parsed,
        Err(err) => return emit_error(&err, json),
    };
    let new_parsed = match parse(config, &args.new)? {
        Ok(parsed) => parsed,
        Err(err) => return emit_error(&err, json),
    };

    let queries = LineageQuery::from_parsed(&old_parsed, &config.schema)
        .and_then(|old| Ok((old, LineageQuery::from_parsed(&new_parsed, &config.schema)?)));
    let (old, new) = match queries {
        Ok(queries) => queries,
        Err(err) => return emit_error(&err, json),
    };

    if verbose {
        eprintln!("{} {}", "Comparing impact of:".cyan(), args.source_column);
    }

    let result = match diff(&old, &new, &args.source_column, &options) {
        Ok(result) => result,
        Err(err) => return emit_error(&err, json),
    };

    if verbose && result.is_empty() {
        eprintln!("{}", "✓ No differences".green());
    }

    let text = match args.format {
        ReportFormat::Json => to_json(&result)?,
        ReportFormat::Tree => render::diff_tree(&result),
    };
    emit(&text, args.output.as_deref())?;

    Ok(true)
}

fn analyze_command(config: &Config, args: &AnalyzeArgs) -> Result<bool> {
    let json = args.format == AnalyzeFormat::Json;
    let parsed = match parse(config, &args.sql)? {
        Ok(parsed) => parsed,
        Err(err) => return emit_error(&err, json),
    };

    let options = AnalyzeOptions {
        max_expr_length: args.max_expr_length.or(config.output.max_expr_length),
        severity: config.severity.clone(),
    };
    let result = match analyze(&parsed, &config.schema, &options) {
        Ok(result) => result,
        Err(err) => return emit_error(&err, json),
    };

    let text = match args.format {
        AnalyzeFormat::Json => to_json(&result)?,
        AnalyzeFormat::Markdown => render::analyze_markdown(&result),
        AnalyzeFormat::Diagram => render::cte_diagram(&result),
        AnalyzeFormat::Summary => render::analyze_summary(&result),
    };
    emit(&text, args.output.as_deref())?;

    Ok(result.success)
}

fn ctes_command(config: &Config, args: &CtesArgs) -> Result<bool> {
    let json = args.format == TextFormat::Json;
    let listing = match parse(config, &args.sql)?.and_then(|parsed| list_ctes(&parsed, &config.schema)) {
        Ok(listing) => listing,
        Err(err) => return emit_error(&err, json),
    };

    let text = match args.format {
        TextFormat::Json => to_json(&listing)?,
        TextFormat::Text => render::ctes_text(&listing),
    };
    emit(&text, None)?;

    Ok(listing.success)
}

fn tables_command(config: &Config, args: &TablesArgs) -> Result<bool> {
    let listing = match parse(config, &args.sql)?.and_then(|parsed| extract_tables(&parsed)) {
        Ok(listing) => listing,
        Err(err) => return emit_error(&err, !args.names_only),
    };

    let text = if args.names_only {
        listing.names().join("\n")
    } else {
        to_json(&listing)?
    };
    emit(&text, None)?;

    Ok(listing.success)
}

fn qualify_command(config: &Config, args: &QualifyArgs) -> Result<bool> {
    let json = args.format == TextFormat::Json;
    let report = match parse(config, &args.sql)?.and_then(|parsed| qualify_report(&parsed, &config.schema)) {
        Ok(report) => report,
        Err(err) => return emit_error(&err, json),
    };

    let text = match args.format {
        TextFormat::Json => to_json(&report)?,
        TextFormat::Text => render::qualify_text(&report),
    };
    emit(&text, None)?;

    Ok(report.success)
}
