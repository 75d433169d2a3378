use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use fit_merge::fit::fit_time_to_utc;
use fit_merge::{
    merge_fit, DuplicatePolicy, MergeOptions, MergeStats, PositionFixPolicy, RecordOutcome,
    SourceSlotMap,
};
use fitparser::de::from_bytes;
use fitparser::profile::MesgNum;
use fitparser::{FitDataField, FitDataRecord, Value as FitValue};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Merge supplementary sensor metrics into a FIT activity", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Merge heart rate, power and ventilation metrics from a source FIT into a base FIT
    Merge(MergeArgs),
    /// Summarize message kinds, record fields and developer fields of FIT files
    Inspect(InspectArgs),
}

#[derive(Parser, Debug)]
struct MergeArgs {
    /// FIT file supplying the route and structural messages
    #[arg(long, value_hint = ValueHint::FilePath)]
    base: PathBuf,

    /// FIT file supplying the physiological metrics
    #[arg(long, value_hint = ValueHint::FilePath)]
    source: PathBuf,

    /// Merged FIT output path
    #[arg(short, long, default_value = "combined.fit", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Merge options JSON (slot map, duplicate policy, file identity)
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Source developer slot map JSON, overriding the config file
    #[arg(long, value_hint = ValueHint::FilePath)]
    slot_map: Option<PathBuf>,

    /// Keep timeline records without heart rate instead of dropping them
    #[arg(long, action = ArgAction::SetTrue)]
    keep_position_fixes: bool,

    /// Resolution for repeated source timestamps
    #[arg(long, value_enum)]
    duplicates: Option<DuplicateOpt>,

    /// Optional CSV with the merge outcome of every record
    #[arg(long, value_hint = ValueHint::FilePath)]
    report: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// FIT files to inspect
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Output report path (`-` for stdout)
    #[arg(short, long, default_value = "-", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum DuplicateOpt {
    First,
    Last,
    Reject,
}

impl From<DuplicateOpt> for DuplicatePolicy {
    fn from(value: DuplicateOpt) -> Self {
        match value {
            DuplicateOpt::First => DuplicatePolicy::FirstWins,
            DuplicateOpt::Last => DuplicatePolicy::LastWins,
            DuplicateOpt::Reject => DuplicatePolicy::Reject,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Merge(args) => args.verbose,
        Command::Inspect(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Merge(args) => handle_merge(args),
        Command::Inspect(args) => handle_inspect(args),
    }
}

fn handle_merge(args: MergeArgs) -> Result<()> {
    let options = resolve_options(&args)?;

    let base = fs::read(&args.base)
        .with_context(|| format!("failed to read {}", args.base.display()))?;
    let source = fs::read(&args.source)
        .with_context(|| format!("failed to read {}", args.source.display()))?;

    let t_merge = Instant::now();
    let (bytes, stats) = merge_fit(&base, &source, &options).with_context(|| {
        format!(
            "failed to merge {} into {}",
            args.source.display(),
            args.base.display()
        )
    })?;
    drop(base);
    drop(source);
    if args.verbose {
        info!(
            "Merge stage: {:.1} ms",
            t_merge.elapsed().as_secs_f64() * 1000.0
        );
    }

    fs::write(&args.output, &bytes)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    info!(
        "Merged FIT file written to {} ({} eligible records, {} matched, {} zero-filled)",
        args.output.display(),
        stats.eligible,
        stats.matched,
        stats.zero_filled
    );
    if stats.eligible > 0 && stats.matched == 0 {
        warn!("No source sample matched a base timestamp; check that both devices share a clock");
    }

    if let Some(path) = args.report.as_ref() {
        write_report(&stats, path)?;
        info!("Wrote merge report: {}", path.display());
    }
    Ok(())
}

/// Config file first, then `--slot-map`, then the remaining flags.
fn resolve_options(args: &MergeArgs) -> Result<MergeOptions> {
    let mut options = match args.config.as_ref() {
        Some(path) => load_options(path)?,
        None => MergeOptions::default(),
    };
    if let Some(path) = args.slot_map.as_ref() {
        options.slot_map = load_slot_map(path)?;
    }
    if args.keep_position_fixes {
        options.position_fixes = PositionFixPolicy::PassThrough;
    }
    if let Some(duplicates) = args.duplicates {
        options.duplicates = duplicates.into();
    }
    Ok(options)
}

fn load_options(path: &Path) -> Result<MergeOptions> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read merge config {}", path.display()))?;
    MergeOptions::from_json(&text)
        .with_context(|| format!("{} is not a valid merge config", path.display()))
}

fn load_slot_map(path: &Path) -> Result<SourceSlotMap> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read slot map {}", path.display()))?;
    SourceSlotMap::from_json(&text)
        .with_context(|| format!("{} is not a valid slot map", path.display()))
}

fn write_report(stats: &MergeStats, path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer.write_record([
        "timestamp",
        "time_utc",
        "outcome",
        "heart_rate",
        "power",
        "cadence",
    ])?;
    for record in &stats.records {
        let timestamp = record.timestamp.map(|ts| ts.to_string()).unwrap_or_default();
        let time_utc = record
            .timestamp
            .and_then(fit_time_to_utc)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        let outcome = match record.outcome {
            RecordOutcome::Matched => "matched",
            RecordOutcome::ZeroFilled => "zero_filled",
        };
        writer.write_record([
            timestamp,
            time_utc,
            outcome.to_string(),
            record.heart_rate.to_string(),
            record.power.to_string(),
            record.cadence.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn handle_inspect(args: InspectArgs) -> Result<()> {
    let mut report = String::new();
    for path in &args.inputs {
        let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let summary = FileSummary::from_bytes(&data)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        report.push_str(&summary.render(&path.display().to_string()));
    }

    if args.output.as_os_str() == "-" {
        io::stdout().lock().write_all(report.as_bytes())?;
    } else {
        fs::write(&args.output, report)
            .with_context(|| format!("failed to write {}", args.output.display()))?;
        info!("Inspection report written: {}", args.output.display());
    }
    Ok(())
}

/// What `inspect` reports for one FIT file.
#[derive(Default)]
struct FileSummary {
    message_counts: BTreeMap<String, usize>,
    developer_fields: Vec<String>,
    record_fields: BTreeMap<String, FieldStats>,
    records: usize,
    span: Option<(i64, i64)>,
}

#[derive(Default, Clone)]
struct FieldStats {
    present: usize,
    numeric: usize,
    range: Option<(f64, f64)>,
}

impl FieldStats {
    fn observe(&mut self, value: Option<f64>) {
        self.present += 1;
        if let Some(v) = value {
            self.numeric += 1;
            self.range = Some(match self.range {
                Some((lo, hi)) => (lo.min(v), hi.max(v)),
                None => (v, v),
            });
        }
    }
}

impl FileSummary {
    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut summary = FileSummary::default();
        for message in from_bytes(data)? {
            *summary
                .message_counts
                .entry(format!("{:?}", message.kind()))
                .or_insert(0) += 1;
            match message.kind() {
                MesgNum::FieldDescription => summary
                    .developer_fields
                    .push(describe_developer_field(message.fields())),
                MesgNum::Record => summary.observe_record(&message),
                _ => {}
            }
        }
        Ok(summary)
    }

    fn observe_record(&mut self, record: &FitDataRecord) {
        self.records += 1;
        for field in record.fields() {
            if let FitValue::Timestamp(ts) = field.value() {
                let seconds = ts.with_timezone(&Utc).timestamp();
                self.span = Some(match self.span {
                    Some((start, end)) => (start.min(seconds), end.max(seconds)),
                    None => (seconds, seconds),
                });
            }
            self.record_fields
                .entry(field.name().to_string())
                .or_default()
                .observe(fit_value_to_f64(field.value()));
        }
    }

    fn render(&self, label: &str) -> String {
        let mut out = format!("FILE: {}\n  records: {}\n", label, self.records);
        if let Some((start, end)) = self.span {
            out.push_str(&format!("  timespan_s: {}\n", end - start));
        }
        out.push_str("  messages:\n");
        for (kind, count) in &self.message_counts {
            out.push_str(&format!("    - {}: {}\n", kind, count));
        }
        if !self.developer_fields.is_empty() {
            out.push_str("  developer_fields:\n");
            for line in &self.developer_fields {
                out.push_str(&format!("    - {}\n", line));
            }
        }
        if !self.record_fields.is_empty() {
            out.push_str("  record_fields:\n");
            let mut fields: Vec<_> = self.record_fields.iter().collect();
            fields.sort_by(|a, b| b.1.present.cmp(&a.1.present).then_with(|| a.0.cmp(b.0)));
            for (name, stats) in fields.into_iter().take(25) {
                let range = stats
                    .range
                    .map_or("n/a".to_string(), |(lo, hi)| format!("{:.3}..{:.3}", lo, hi));
                out.push_str(&format!(
                    "    - {}: present={}, numeric={}, range={}\n",
                    name, stats.present, stats.numeric, range
                ));
            }
        }
        out.push('\n');
        out
    }
}

fn describe_developer_field(fields: &[FitDataField]) -> String {
    let text = |name: &str| {
        fields
            .iter()
            .find(|f| f.name() == name)
            .and_then(|f| match f.value() {
                FitValue::String(s) => Some(s.clone()),
                other => fit_value_to_f64(other).map(|v| v.to_string()),
            })
    };
    let index = text("developer_data_index").unwrap_or_else(|| "?".into());
    let number = text("field_definition_number").unwrap_or_else(|| "?".into());
    let name = text("field_name").unwrap_or_else(|| "unnamed".into());
    match text("units") {
        Some(units) if !units.is_empty() => format!("[{}:{}] {} ({})", index, number, name, units),
        _ => format!("[{}:{}] {}", index, number, name),
    }
}

fn fit_value_to_f64(value: &FitValue) -> Option<f64> {
    match value {
        FitValue::Float32(v) => Some(f64::from(*v)),
        FitValue::Float64(v) => Some(*v),
        FitValue::SInt8(v) => Some(f64::from(*v)),
        FitValue::SInt16(v) => Some(f64::from(*v)),
        FitValue::SInt32(v) => Some(f64::from(*v)),
        FitValue::SInt64(v) => Some(*v as f64),
        FitValue::UInt8(v) | FitValue::UInt8z(v) | FitValue::Byte(v) | FitValue::Enum(v) => {
            Some(f64::from(*v))
        }
        FitValue::UInt16(v) | FitValue::UInt16z(v) => Some(f64::from(*v)),
        FitValue::UInt32(v) | FitValue::UInt32z(v) => Some(f64::from(*v)),
        FitValue::UInt64(v) | FitValue::UInt64z(v) => Some(*v as f64),
        FitValue::Array(values) => values.iter().find_map(fit_value_to_f64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fit_merge::encode::FitEncoder;
    use fit_merge::fit::{DevField, FitMessage, RawField, TIMESTAMP_FIELD};
    use fit_merge::profile::{MesgNum as FitMesgNum, RecordField};
    use fit_merge::{merge_fit, DeveloperFieldSchema, FileIdentity, RecordReport};

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fitmerge-{}-{}", name, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn encode(messages: &[FitMessage]) -> Vec<u8> {
        let mut encoder = FitEncoder::new(Vec::new());
        for message in messages {
            encoder.write_message(message).unwrap();
        }
        encoder.finish().unwrap()
    }

    fn record(ts: u32, hr: u8) -> FitMessage {
        FitMessage::new(FitMesgNum::Record)
            .with_field(RawField::uint32(TIMESTAMP_FIELD, ts))
            .with_field(RawField::uint8(RecordField::HeartRate.number(), hr))
    }

    fn merge_args(extra: &[&str]) -> MergeArgs {
        let mut argv = vec!["fitmerge", "merge", "--base", "a.fit", "--source", "b.fit"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Merge(args) => args,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = scratch_dir("options");
        let config = dir.join("config.json");
        fs::write(
            &config,
            r#"{"duplicates": "reject", "position_fixes": "drop",
                "slot_map": {"breath_rate": 5}, "file_identity": {"product": 42}}"#,
        )
        .unwrap();
        let config_arg = config.to_string_lossy().to_string();

        let from_file = resolve_options(&merge_args(&["--config", &config_arg])).unwrap();
        assert_eq!(from_file.duplicates, DuplicatePolicy::Reject);
        assert_eq!(from_file.position_fixes, PositionFixPolicy::Drop);
        assert_eq!(from_file.slot_map.breath_rate, 5);

        let slot_map = dir.join("slots.json");
        fs::write(&slot_map, r#"{"breath_rate": 9, "tidal_volume": 10}"#).unwrap();
        let slot_arg = slot_map.to_string_lossy().to_string();
        let layered = resolve_options(&merge_args(&[
            "--config",
            &config_arg,
            "--slot-map",
            &slot_arg,
            "--duplicates",
            "first",
            "--keep-position-fixes",
        ]))
        .unwrap();
        assert_eq!(layered.duplicates, DuplicatePolicy::FirstWins);
        assert_eq!(layered.position_fixes, PositionFixPolicy::PassThrough);
        assert_eq!(layered.slot_map.breath_rate, 9);
        assert_eq!(layered.slot_map.tidal_volume, 10);
        assert_eq!(layered.file_identity.product, 42);

        assert_eq!(resolve_options(&merge_args(&[])).unwrap(), MergeOptions::default());
        assert!(resolve_options(&merge_args(&["--config", "missing.json"])).is_err());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_summary_of_merged_file() {
        let base = encode(&[
            FileIdentity::default().to_message(),
            record(100, 90),
            record(101, 91),
            record(130, 92),
        ]);
        let mut source = DeveloperFieldSchema::ventilation(0).to_messages();
        source.push(
            record(101, 140)
                .with_developer_field(DevField::new(0, RawField::uint16(0, 1500)))
                .with_developer_field(DevField::new(0, RawField::uint16(1, 50))),
        );
        let (merged, _) = merge_fit(&base, &encode(&source), &MergeOptions::default()).unwrap();

        let summary = FileSummary::from_bytes(&merged).unwrap();
        assert_eq!(summary.records, 3);
        assert_eq!(summary.span, Some((100 + 631_065_600, 130 + 631_065_600)));
        assert_eq!(
            summary.developer_fields,
            vec![
                "[0:0] breath_rate (breaths/min)",
                "[0:1] tidal_volume (L)",
                "[0:2] minute_volume (L/min)",
                "[0:3] ve_zone (zone)",
            ]
        );
        let heart_rate = &summary.record_fields["heart_rate"];
        assert_eq!(heart_rate.present, 3);
        assert_eq!(heart_rate.range, Some((0.0, 140.0)));

        let text = summary.render("merged.fit");
        assert!(text.starts_with("FILE: merged.fit\n  records: 3\n  timespan_s: 30\n"));
        assert!(text.contains("    - FieldDescription: 4\n"));
        assert!(text.contains("    - heart_rate: present=3, numeric=3, range=0.000..140.000\n"));
    }

    #[test]
    fn test_summary_rejects_garbage() {
        assert!(FileSummary::from_bytes(b"not a fit file").is_err());
    }

    #[test]
    fn test_duplicate_opt_mapping() {
        assert_eq!(DuplicatePolicy::from(DuplicateOpt::First), DuplicatePolicy::FirstWins);
        assert_eq!(DuplicatePolicy::from(DuplicateOpt::Last), DuplicatePolicy::LastWins);
        assert_eq!(DuplicatePolicy::from(DuplicateOpt::Reject), DuplicatePolicy::Reject);
    }

    #[test]
    fn test_cli_parses_merge_args() {
        let cli = Cli::try_parse_from([
            "fitmerge",
            "merge",
            "--base",
            "strava.fit",
            "--source",
            "tymewear.fit",
            "--duplicates",
            "first",
            "--keep-position-fixes",
        ])
        .unwrap();
        match cli.command {
            Command::Merge(args) => {
                assert_eq!(args.output, PathBuf::from("combined.fit"));
                assert!(args.keep_position_fixes);
                assert!(matches!(args.duplicates, Some(DuplicateOpt::First)));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_write_report() {
        let dir = std::env::temp_dir().join(format!("fitmerge-report-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("report.csv");
        let stats = MergeStats {
            records: vec![
                RecordReport {
                    timestamp: Some(0),
                    outcome: RecordOutcome::Matched,
                    heart_rate: 140,
                    power: 200,
                    cadence: 0,
                },
                RecordReport {
                    timestamp: None,
                    outcome: RecordOutcome::ZeroFilled,
                    heart_rate: 0,
                    power: 0,
                    cadence: 0,
                },
            ],
            ..MergeStats::default()
        };
        write_report(&stats, &path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "timestamp,time_utc,outcome,heart_rate,power,cadence");
        assert_eq!(lines[1], "0,1989-12-31T00:00:00+00:00,matched,140,200,0");
        assert_eq!(lines[2], ",,zero_filled,0,0,0");
        let _ = fs::remove_dir_all(&dir);
    }
}
