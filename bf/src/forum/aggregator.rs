//! The forum tail loop.
//!
//! One cooperative task polls the three engine logs once a second,
//! comparing sizes and line counts. Polling rather than filesystem
//! notifications is deliberate: it is portable and makes truncation
//! (an engine restarting its log) a first-class signal.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Local;
use reportstore::Engine;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::jsonrepair::RobustJsonParser;

use super::host::HostSpeaker;
use super::parse::{
    self, ForumSource, clean_content_tags, extract_json_content, extract_node_content,
    is_first_summary_line, is_json_end, is_json_start, is_target_line, is_valuable_content,
    strip_timestamp,
};

/// Aggregator settings
#[derive(Debug, Clone)]
pub struct ForumConfig {
    pub forum_log: PathBuf,
    pub monitored: BTreeMap<Engine, PathBuf>,
    pub host_speech_threshold: usize,
    pub idle_ticks_limit: u64,
    pub tick: Duration,
}

impl ForumConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let monitored = Engine::ALL
            .into_iter()
            .map(|engine| (engine, settings.engine_log_path(engine)))
            .collect();
        Self {
            forum_log: settings.forum_log_path(),
            monitored,
            host_speech_threshold: settings.host_speech_threshold,
            idle_ticks_limit: settings.forum_idle_ticks_limit,
            tick: Duration::from_secs(1),
        }
    }
}

/// Serialized writer for forum.log. One lock guards every append so lines
/// are atomic at the file level.
struct ForumWriter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ForumWriter {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Append one `[HH:MM:SS] [TAG] content` line. Embedded newlines are
    /// escaped so every record stays on one line. Returns the line as
    /// written (without the trailing newline).
    fn append(&self, content: &str, source: ForumSource) -> Option<String> {
        let _guard = self.lock.lock().expect("forum writer lock");
        let timestamp = Local::now().format("%H:%M:%S");
        let one_line = content.replace('\n', "\\n").replace('\r', "\\r");
        let line = format!("[{timestamp}] [{source}] {one_line}");

        if let Some(parent) = self.path.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warn!(error = %e, "could not create forum log directory");
            return None;
        }
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{line}"));
        match result {
            Ok(()) => Some(line),
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "failed to write forum.log");
                None
            }
        }
    }

    /// Remove the previous session's log; the caller writes the fresh
    /// SYSTEM start line right after.
    fn reset(&self) {
        let _guard = self.lock.lock().expect("forum writer lock");
        if self.path.exists()
            && let Err(e) = fs::remove_file(&self.path)
        {
            warn!(error = %e, "could not reset forum.log");
        }
    }
}

#[derive(Debug, Default)]
struct EngineTailState {
    position: u64,
    line_count: u64,
    capturing: bool,
    json_buffer: Vec<String>,
    in_error_block: bool,
}

impl EngineTailState {
    fn reset_capture(&mut self) {
        self.capturing = false;
        self.json_buffer.clear();
        self.in_error_block = false;
    }
}

/// Tail-and-parse pipeline over the three engine logs
pub struct ForumAggregator {
    config: ForumConfig,
    writer: ForumWriter,
    parser: RobustJsonParser,
    host: Option<HostSpeaker>,
    states: BTreeMap<Engine, EngineTailState>,
    searching: bool,
    inactive_count: u64,
    speech_buffer: Vec<String>,
}

impl ForumAggregator {
    pub fn new(config: ForumConfig, host: Option<HostSpeaker>) -> Self {
        let writer = ForumWriter::new(config.forum_log.clone());
        let states = config
            .monitored
            .keys()
            .map(|engine| (*engine, EngineTailState::default()))
            .collect();
        Self {
            config,
            writer,
            parser: RobustJsonParser::new(),
            host,
            states,
            searching: false,
            inactive_count: 0,
            speech_buffer: Vec::new(),
        }
    }

    /// Record current file sizes and line counts as the idle baseline, so
    /// a freshly started aggregator ignores history already in the logs.
    pub fn initialize_positions(&mut self) {
        for (engine, path) in &self.config.monitored {
            let state = self.states.get_mut(engine).expect("state exists");
            state.position = file_size(path);
            state.line_count = count_lines(path);
            state.reset_capture();
        }
        info!("forum aggregator baseline initialized");
    }

    /// One tick of the tail loop.
    pub async fn poll_once(&mut self) {
        let mut any_growth = false;
        let mut any_shrink = false;
        let mut captured_any = false;

        let engines: Vec<Engine> = self.config.monitored.keys().copied().collect();
        for engine in engines {
            let path = self.config.monitored[&engine].clone();
            let current_lines = count_lines(&path);
            let previous_lines = self.states[&engine].line_count;

            if current_lines > previous_lines {
                any_growth = true;
                let new_lines = self.read_new_lines(engine, &path);

                if !self.searching
                    && let Some(trigger) = new_lines.iter().find(|l| is_first_summary_line(l))
                {
                    debug!(%engine, line = %trigger, "first summary detected");
                    info!(%engine, "forum session opened");
                    self.searching = true;
                    self.inactive_count = 0;
                    self.start_session();
                }

                if self.searching {
                    let captured = self.process_lines(engine, &new_lines);
                    for content in captured {
                        let source = source_for(engine);
                        if let Some(line) = self.writer.append(&content, source) {
                            captured_any = true;
                            self.speech_buffer.push(line);
                            self.maybe_trigger_host().await;
                        }
                    }
                }
            } else if current_lines < previous_lines {
                any_shrink = true;
                let state = self.states.get_mut(&engine).expect("state exists");
                state.position = file_size(&path);
                state.reset_capture();
            }

            self.states.get_mut(&engine).expect("state exists").line_count = current_lines;
        }

        if self.searching {
            if any_shrink {
                info!("engine log shrank, closing forum session");
                self.end_session();
            } else if !any_growth && !captured_any {
                self.inactive_count += 1;
                if self.inactive_count >= self.config.idle_ticks_limit {
                    info!(ticks = self.inactive_count, "no activity, closing forum session");
                    self.end_session();
                }
            } else {
                self.inactive_count = 0;
            }
        }
    }

    fn start_session(&mut self) {
        self.writer.reset();
        let now = Local::now().format("%Y-%m-%d %H:%M:%S");
        self.writer
            .append(&format!("=== ForumEngine monitoring starts - {now} ==="), ForumSource::System);
        for state in self.states.values_mut() {
            state.reset_capture();
        }
        self.speech_buffer.clear();
    }

    fn end_session(&mut self) {
        self.searching = false;
        self.inactive_count = 0;
        self.speech_buffer.clear();
        let now = Local::now().format("%Y-%m-%d %H:%M:%S");
        self.writer
            .append(&format!("=== ForumEngine forum ends - {now} ==="), ForumSource::System);
    }

    /// Read bytes appended since the recorded position. A shrunken file
    /// resets the offset and any capture in progress.
    fn read_new_lines(&mut self, engine: Engine, path: &Path) -> Vec<String> {
        let state = self.states.get_mut(&engine).expect("state exists");
        let current_size = file_size(path);

        if current_size < state.position {
            state.position = 0;
            state.reset_capture();
        }
        if current_size <= state.position {
            return Vec::new();
        }

        let Ok(mut file) = File::open(path) else {
            return Vec::new();
        };
        if file.seek(SeekFrom::Start(state.position)).is_err() {
            return Vec::new();
        }
        let mut new_content = String::new();
        if file.read_to_string(&mut new_content).is_err() {
            warn!(%engine, "failed to read appended log bytes");
            return Vec::new();
        }
        state.position = current_size;

        new_content
            .split('\n')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// The per-line JSON capture state machine, with ERROR-block
    /// filtering: from an ERROR line until the next INFO line, nothing is
    /// trusted.
    fn process_lines(&mut self, engine: Engine, lines: &[String]) -> Vec<String> {
        let mut captured = Vec::new();

        for line in lines {
            let state = self.states.get_mut(&engine).expect("state exists");

            match parse::log_level(line) {
                Some("ERROR") => {
                    state.in_error_block = true;
                    state.capturing = false;
                    state.json_buffer.clear();
                    continue;
                }
                Some("INFO") => state.in_error_block = false,
                _ => {}
            }
            if state.in_error_block {
                state.capturing = false;
                state.json_buffer.clear();
                continue;
            }

            let target = is_target_line(line);
            let json_start = is_json_start(line);

            if target && json_start {
                state.capturing = true;
                state.json_buffer = vec![line.clone()];
                if line.trim().ends_with('}') {
                    let buffer = std::mem::take(&mut state.json_buffer);
                    state.capturing = false;
                    if let Some(content) = extract_json_content(&buffer, &self.parser) {
                        captured.push(clean_content_tags(&content));
                    }
                }
            } else if target && is_valuable_content(line) {
                captured.push(clean_content_tags(&extract_node_content(line)));
            } else if state.capturing {
                state.json_buffer.push(line.clone());
                if is_json_end(&strip_timestamp(line)) {
                    let buffer = std::mem::take(&mut state.json_buffer);
                    state.capturing = false;
                    if let Some(content) = extract_json_content(&buffer, &self.parser) {
                        captured.push(clean_content_tags(&content));
                    }
                }
            }
        }

        captured
    }

    /// Invoke the moderator once the buffer reaches the threshold. The call
    /// is awaited inline, so moderator output lands in forum.log exactly
    /// where the discussion stood.
    async fn maybe_trigger_host(&mut self) {
        let threshold = self.config.host_speech_threshold;
        if self.speech_buffer.len() < threshold {
            return;
        }
        let Some(host) = &self.host else {
            return;
        };
        let batch: Vec<String> = self.speech_buffer[..threshold].to_vec();
        match host.generate_speech(&batch).await {
            Some(speech) => {
                self.writer.append(&speech, ForumSource::Host);
                self.speech_buffer.drain(..threshold);
            }
            None => warn!("moderator speech generation failed"),
        }
    }

    /// Run the loop until shutdown is signalled.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.initialize_positions();
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("forum aggregator started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_once().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let now = Local::now().format("%Y-%m-%d %H:%M:%S");
        self.writer
            .append(&format!("=== ForumEngine forum ends - {now} ==="), ForumSource::System);
        info!("forum aggregator stopped");
    }
}

fn source_for(engine: Engine) -> ForumSource {
    match engine {
        Engine::Insight => ForumSource::Insight,
        Engine::Media => ForumSource::Media,
        Engine::Query => ForumSource::Query,
    }
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn count_lines(path: &Path) -> u64 {
    let Ok(file) = File::open(path) else {
        return 0;
    };
    BufReader::new(file).lines().count() as u64
}

/// Running aggregator handle
pub struct ForumHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ForumHandle {
    /// Signal shutdown and wait briefly for the loop to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if tokio::time::timeout(Duration::from_secs(2), self.join).await.is_err() {
            warn!("forum aggregator did not stop in time");
        }
    }
}

/// Spawn the aggregator on its own task.
pub fn start_forum(config: ForumConfig, host: Option<HostSpeaker>) -> ForumHandle {
    let (tx, rx) = watch::channel(false);
    let aggregator = ForumAggregator::new(config, host);
    let join = tokio::spawn(aggregator.run(rx));
    ForumHandle { shutdown: tx, join }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::mock::{MockLlmClient, MockOutcome};
    use crate::retry::RetryConfig;
    use std::sync::Arc;
    use tempfile::TempDir;

    const PREFIX: &str = "2025-01-02 10:11:12.123 | INFO | InsightEngine.nodes.summary_node:run:88 - ";

    fn config(temp: &TempDir) -> ForumConfig {
        let log_dir = temp.path().join("logs");
        fs::create_dir_all(&log_dir).unwrap();
        let monitored = Engine::ALL
            .into_iter()
            .map(|e| (e, log_dir.join(format!("{e}.log"))))
            .collect();
        ForumConfig {
            forum_log: log_dir.join("forum.log"),
            monitored,
            host_speech_threshold: 5,
            idle_ticks_limit: 7200,
            tick: Duration::from_millis(10),
        }
    }

    fn append(config: &ForumConfig, engine: Engine, lines: &[String]) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.monitored[&engine])
            .unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
    }

    fn trigger_line() -> String {
        format!("{PREFIX}FirstSummaryNode 正在生成首次段落总结")
    }

    fn burst(n: usize) -> String {
        format!(
            "{PREFIX}Cleaned output: {{\"paragraph_latest_state\": \"观点{n}：围绕该事件的讨论仍在发酵\"}}"
        )
    }

    fn mock_host() -> HostSpeaker {
        HostSpeaker::with_retry(
            Arc::new(MockLlmClient::repeating("主持人总结：讨论已经形成共识。")),
            RetryConfig {
                max_retries: 0,
                initial_delay: Duration::from_millis(1),
                backoff_factor: 1.0,
                max_delay: Duration::from_millis(1),
            },
        )
    }

    fn forum_lines(config: &ForumConfig) -> Vec<String> {
        fs::read_to_string(&config.forum_log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_session_opens_on_first_summary() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let mut aggregator = ForumAggregator::new(config.clone(), None);
        aggregator.initialize_positions();

        append(&config, Engine::Insight, &[trigger_line(), burst(1)]);
        aggregator.poll_once().await;

        let lines = forum_lines(&config);
        assert!(lines[0].contains("[SYSTEM]"));
        assert!(lines[0].contains("monitoring starts"));
        assert!(lines[1].contains("[INSIGHT]"));
        assert!(lines[1].contains("观点1"));
    }

    #[tokio::test]
    async fn test_idle_without_trigger_writes_nothing() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let mut aggregator = ForumAggregator::new(config.clone(), None);
        aggregator.initialize_positions();

        append(&config, Engine::Media, &[burst(1)]);
        aggregator.poll_once().await;

        assert!(forum_lines(&config).is_empty());
    }

    #[tokio::test]
    async fn test_host_triggered_after_threshold() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let mut aggregator = ForumAggregator::new(config.clone(), Some(mock_host()));
        aggregator.initialize_positions();

        // Trigger plus six bursts: the host speaks after the fifth, the
        // sixth lands after the HOST line, one entry stays buffered.
        let mut lines = vec![trigger_line()];
        for n in 1..=6 {
            lines.push(burst(n));
        }
        append(&config, Engine::Insight, &lines);
        aggregator.poll_once().await;

        let written = forum_lines(&config);
        let tags: Vec<&str> = written
            .iter()
            .map(|l| parse::parse_forum_line(l).unwrap().source.as_str())
            .collect();
        assert_eq!(
            tags,
            vec![
                "SYSTEM", "INSIGHT", "INSIGHT", "INSIGHT", "INSIGHT", "INSIGHT", "HOST", "INSIGHT"
            ]
        );
        assert_eq!(aggregator.speech_buffer.len(), 1);
    }

    #[tokio::test]
    async fn test_error_block_suppresses_capture() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let mut aggregator = ForumAggregator::new(config.clone(), None);
        aggregator.initialize_positions();

        let lines = vec![
            trigger_line(),
            // Multi-line capture interrupted by an ERROR line.
            format!("{PREFIX}Cleaned output: {{"),
            "2025-01-02 10:11:13.000 | ERROR | nodes.summary_node:run:90 - JSON repair failed".to_string(),
            "\"paragraph_latest_state\": \"孤立行\"".to_string(),
            "}".to_string(),
            // Recovery: INFO line clears the block, a fresh burst lands.
            burst(9),
        ];
        append(&config, Engine::Query, &lines);
        aggregator.poll_once().await;

        let written = forum_lines(&config);
        assert_eq!(written.len(), 2);
        assert!(written[1].contains("观点9"));
    }

    #[tokio::test]
    async fn test_multi_line_json_capture() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let mut aggregator = ForumAggregator::new(config.clone(), None);
        aggregator.initialize_positions();

        let lines = vec![
            trigger_line(),
            format!("{PREFIX}Cleaned output: {{"),
            "[10:11:13] \"updated_paragraph_latest_state\": \"多行内容第一段\\n第二段\"".to_string(),
            "}".to_string(),
        ];
        append(&config, Engine::Insight, &lines);
        aggregator.poll_once().await;

        let written = forum_lines(&config);
        assert_eq!(written.len(), 2);
        assert!(written[1].contains("多行内容第一段"));
        // Embedded newline stays escaped; every record is one line.
        assert!(!written[1].contains('\n'));
    }

    #[tokio::test]
    async fn test_shrink_ends_session() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let mut aggregator = ForumAggregator::new(config.clone(), None);
        aggregator.initialize_positions();

        append(&config, Engine::Insight, &[trigger_line(), burst(1)]);
        aggregator.poll_once().await;
        assert!(aggregator.searching);

        // Engine restarts: its log is truncated.
        fs::write(&config.monitored[&Engine::Insight], "").unwrap();
        aggregator.poll_once().await;

        assert!(!aggregator.searching);
        let written = forum_lines(&config);
        assert!(written.last().unwrap().contains("forum ends"));
    }

    #[tokio::test]
    async fn test_idle_ticks_end_session() {
        let temp = TempDir::new().unwrap();
        let mut config = config(&temp);
        config.idle_ticks_limit = 2;
        let mut aggregator = ForumAggregator::new(config.clone(), None);
        aggregator.initialize_positions();

        append(&config, Engine::Insight, &[trigger_line(), burst(1)]);
        aggregator.poll_once().await;
        assert!(aggregator.searching);

        aggregator.poll_once().await;
        assert!(aggregator.searching);
        aggregator.poll_once().await;
        assert!(!aggregator.searching);
        assert!(forum_lines(&config).last().unwrap().contains("forum ends"));
    }

    #[tokio::test]
    async fn test_forum_line_format_invariant() {
        let temp = TempDir::new().unwrap();
        let config = config(&temp);
        let mut aggregator = ForumAggregator::new(config.clone(), Some(mock_host()));
        aggregator.initialize_positions();

        let mut lines = vec![trigger_line()];
        for n in 1..=6 {
            lines.push(burst(n));
        }
        append(&config, Engine::Media, &lines);
        // The trigger marker also opens sessions from media/query logs.
        aggregator.poll_once().await;

        for line in forum_lines(&config) {
            assert!(
                parse::parse_forum_line(&line).is_some(),
                "malformed forum line: {line}"
            );
        }
    }

    #[tokio::test]
    async fn test_second_session_resets_log() {
        let temp = TempDir::new().unwrap();
        let mut config = config(&temp);
        config.idle_ticks_limit = 1;
        let mut aggregator = ForumAggregator::new(config.clone(), None);
        aggregator.initialize_positions();

        append(&config, Engine::Insight, &[trigger_line(), burst(1)]);
        aggregator.poll_once().await;
        aggregator.poll_once().await; // idle tick closes the session
        assert!(!aggregator.searching);

        // A new first summary starts a fresh log.
        append(&config, Engine::Insight, &[trigger_line(), burst(2)]);
        aggregator.poll_once().await;

        let written = forum_lines(&config);
        assert!(written[0].contains("monitoring starts"));
        assert!(written.iter().all(|l| !l.contains("观点1")));
        assert!(written.iter().any(|l| l.contains("观点2")));
    }
}
