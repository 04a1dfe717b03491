//! Generator invocation - build the argument vector and run the external program
//!
//! The generator is judged only by its exit status. Standard output and
//! standard error are read line by line as they arrive, logged, and kept in
//! arrival order as the combined output.

use popgen_core::{Error, GenerationParameters, GeneratorConfig, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Lines of output kept on a failed run for error reporting.
const OUTPUT_TAIL_LINES: usize = 20;

/// Build generator arguments. Each flag appears only when its field is present.
pub fn build_args(params: &GenerationParameters) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(size) = params.population_size {
        args.push("-p".to_string());
        args.push(size.to_string());
    }
    if let Some(gender) = params.gender {
        args.push("-g".to_string());
        args.push(gender.flag_value().to_string());
    }
    if let Some(range) = params.age_range {
        args.push("-a".to_string());
        args.push(range.to_string());
    }
    if let Some(location) = &params.location {
        args.push(location.state().to_string());
        if let Some(city) = location.city() {
            args.push(city.to_string());
        }
    }

    args
}

/// Result of one generator run.
#[derive(Clone, Debug)]
pub struct GeneratorOutput {
    /// Exit code, `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub success: bool,
    /// Stdout and stderr lines, interleaved in arrival order.
    pub lines: Vec<String>,
}

impl GeneratorOutput {
    /// Turn a non-zero exit into a fatal generation error.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.success {
            return Ok(self.lines);
        }
        let skip = self.lines.len().saturating_sub(OUTPUT_TAIL_LINES);
        Err(Error::GenerationFailed {
            reason: match self.exit_code {
                Some(code) => format!("generator exited with code {}", code),
                None => "generator was terminated by a signal".to_string(),
            },
            code: self.exit_code,
            output_tail: self.lines.into_iter().skip(skip).collect(),
        })
    }
}

pub struct GeneratorInvoker {
    root: PathBuf,
    program: PathBuf,
    leading_args: Vec<String>,
    timeout: Option<Duration>,
}

impl GeneratorInvoker {
    pub fn new(config: &GeneratorConfig) -> Self {
        Self {
            root: config.root.clone(),
            program: resolve_program(&config.root, &config.program),
            leading_args: config.args.clone(),
            timeout: config.timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run the generator and wait for it to exit. Fails only if the process
    /// could not be spawned or waited on, or if it outlived the timeout.
    pub async fn invoke(&self, params: &GenerationParameters) -> Result<GeneratorOutput> {
        let args = build_args(params);
        info!(
            "Starting generator {} {:?} in {}",
            self.program.display(),
            args,
            self.root.display()
        );

        let mut child = Command::new(&self.program)
            .args(&self.leading_args)
            .args(&args)
            .current_dir(&self.root)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::generation_failed(format!(
                    "failed to spawn {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let run = async {
            let lines = collect_combined(stdout, stderr).await;
            let status = child.wait().await?;
            Ok::<_, Error>((status, lines))
        };

        let (status, lines) = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result?,
                Err(_) => {
                    // kill_on_drop terminates the child once it goes out of scope.
                    warn!("Generator exceeded {}s, killed", limit.as_secs());
                    return Err(Error::GenerationTimedOut {
                        secs: limit.as_secs(),
                    });
                }
            },
            None => run.await?,
        };

        info!("Generator exited with {} ({} lines of output)", status, lines.len());
        Ok(GeneratorOutput {
            exit_code: status.code(),
            success: status.success(),
            lines,
        })
    }

    /// Invoke and require a zero exit status.
    pub async fn run(&self, params: &GenerationParameters) -> Result<Vec<String>> {
        self.invoke(params).await?.into_result()
    }
}

/// A relative program containing a path separator is taken relative to the
/// generator root; bare names are left for PATH lookup.
fn resolve_program(root: &Path, program: &str) -> PathBuf {
    let path = Path::new(program);
    if path.is_relative() && path.components().count() > 1 {
        root.join(path)
    } else {
        path.to_path_buf()
    }
}

/// Consecutive read errors tolerated on one pipe before it is abandoned.
const MAX_READ_ERRORS: usize = 3;

/// One output pipe. Bytes of a partially read line stay in `buf` when a read
/// is cancelled by the other pipe winning the select.
struct Pipe<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    errors: usize,
}

impl<R: AsyncRead + Unpin> Pipe<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
            errors: 0,
        }
    }

    /// Next line, decoded lossily. `None` only at EOF or after repeated errors.
    async fn next_line(&mut self) -> Option<String> {
        loop {
            match self.reader.read_until(b'\n', &mut self.buf).await {
                Ok(0) if self.buf.is_empty() => return None,
                Ok(_) => {
                    self.errors = 0;
                    return Some(take_line(&mut self.buf));
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.errors += 1;
                    warn!("Error reading generator output: {}", e);
                    if self.errors >= MAX_READ_ERRORS {
                        warn!("Giving up on generator output pipe");
                        return None;
                    }
                }
            }
        }
    }
}

fn take_line(buf: &mut Vec<u8>) -> String {
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    let line = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    line
}

/// Drain both pipes concurrently until each reaches EOF.
async fn collect_combined(
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
) -> Vec<String> {
    let mut out = stdout.map(Pipe::new);
    let mut err = stderr.map(Pipe::new);
    let mut lines = Vec::new();

    loop {
        tokio::select! {
            line = next_line(&mut out), if out.is_some() => match line {
                Some(line) => {
                    debug!(target: "popgen::generator", "{}", line);
                    lines.push(line);
                }
                None => out = None,
            },
            line = next_line(&mut err), if err.is_some() => match line {
                Some(line) => {
                    debug!(target: "popgen::generator", "{}", line);
                    lines.push(line);
                }
                None => err = None,
            },
            else => break,
        }
    }

    lines
}

async fn next_line<R: AsyncRead + Unpin>(pipe: &mut Option<Pipe<R>>) -> Option<String> {
    match pipe {
        Some(pipe) => pipe.next_line().await,
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use popgen_core::GenerationRequest;

    fn args_for(req: GenerationRequest) -> Vec<String> {
        build_args(&req.validate().unwrap())
    }

    #[test]
    fn full_parameter_set() {
        let args = args_for(GenerationRequest {
            population_size: Some(50),
            gender: Some("f".into()),
            min_age: Some(10),
            max_age: Some(20),
            state: Some("Massachusetts".into()),
            city: None,
        });
        assert_eq!(args, ["-p", "50", "-g", "F", "-a", "10-20", "Massachusetts"]);
    }

    #[test]
    fn empty_state_drops_city() {
        let args = args_for(GenerationRequest {
            state: Some("".into()),
            city: Some("Boston".into()),
            ..Default::default()
        });
        assert!(args.is_empty());
    }

    #[test]
    fn city_follows_state() {
        let args = args_for(GenerationRequest {
            state: Some("Massachusetts".into()),
            city: Some("Boston".into()),
            ..Default::default()
        });
        assert_eq!(args, ["Massachusetts", "Boston"]);
    }

    #[test]
    fn each_flag_present_iff_field_present() {
        let flags = ["-p", "-g", "-a"];
        for mask in 0u8..8 {
            let req = GenerationRequest {
                population_size: (mask & 1 != 0).then_some(7),
                gender: (mask & 2 != 0).then(|| "m".to_string()),
                min_age: (mask & 4 != 0).then_some(1),
                max_age: (mask & 4 != 0).then_some(2),
                ..Default::default()
            };
            let args = args_for(req);
            for (bit, flag) in flags.iter().enumerate() {
                let count = args.iter().filter(|a| a == flag).count();
                let expected = usize::from(mask & (1 << bit) != 0);
                assert_eq!(count, expected, "mask {:03b} flag {}", mask, flag);
            }
            assert_eq!(args.len(), 2 * mask.count_ones() as usize);
        }
    }

    #[test]
    fn program_resolution() {
        let root = Path::new("/opt/gen");
        assert_eq!(resolve_program(root, "./run_synthea"), PathBuf::from("/opt/gen/./run_synthea"));
        assert_eq!(resolve_program(root, "sh"), PathBuf::from("sh"));
        assert_eq!(resolve_program(root, "/bin/sh"), PathBuf::from("/bin/sh"));
    }

    #[test]
    fn failed_output_keeps_tail() {
        let output = GeneratorOutput {
            exit_code: Some(2),
            success: false,
            lines: (0..30).map(|i| i.to_string()).collect(),
        };
        match output.into_result() {
            Err(Error::GenerationFailed { code, output_tail, .. }) => {
                assert_eq!(code, Some(2));
                assert_eq!(output_tail.len(), OUTPUT_TAIL_LINES);
                assert_eq!(output_tail.last().map(String::as_str), Some("29"));
            }
            other => panic!("expected GenerationFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn output_lines_decode_leniently() {
        let mut pipe = Pipe::new(&b"caf\xe9\r\nnext\n\xff\xfe\nlast without newline"[..]);
        assert_eq!(pipe.next_line().await.as_deref(), Some("caf\u{fffd}"));
        assert_eq!(pipe.next_line().await.as_deref(), Some("next"));
        assert_eq!(pipe.next_line().await.as_deref(), Some("\u{fffd}\u{fffd}"));
        assert_eq!(pipe.next_line().await.as_deref(), Some("last without newline"));
        assert_eq!(pipe.next_line().await, None);
    }
}
