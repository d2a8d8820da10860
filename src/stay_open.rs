use crate::config::StayOpenConfig;
use crate::error::ExifToolError;
use crate::framing::{self, FrameReader, SHUTDOWN};
use crate::utils::json_record_error;
use log::{debug, warn};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const STDERR_POLL_INTERVAL: Duration = Duration::from_millis(5);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

type Response = Result<Vec<u8>, ExifToolError>;

/// A single `exiftool` process kept running in `-stay_open` mode.
///
/// Requests are written to the process's stdin and answered on its stdout,
/// one at a time. Every method takes `&self`, so a `StayOpen` can be shared
/// between threads (e.g. in an `Arc`); concurrent callers simply queue up.
///
/// Three background threads belong to each process: one writes requests to
/// stdin, one splits stdout into responses, one collects stderr lines. All
/// three are joined by [`StayOpen::stop`], which also runs on drop.
///
/// Once stopped, either explicitly or because the process died mid-request,
/// every call fails with [`ExifToolError::Stopped`]. A stopped `StayOpen` is
/// never restarted; create a new one instead.
#[derive(Debug)]
pub struct StayOpen {
    config: StayOpenConfig,
    pid: u32,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    process: Option<Process>,
    requests_served: usize,
}

#[derive(Debug)]
struct Process {
    child: Child,
    requests: Sender<Vec<String>>,
    responses: Receiver<Response>,
    stderr: Receiver<String>,
    feeder: JoinHandle<()>,
    drainer: JoinHandle<()>,
    stderr_reader: JoinHandle<()>,
}

impl StayOpen {
    /// Launches `exiftool` from `PATH` with `-json` as the default argument.
    pub fn new() -> Result<Self, ExifToolError> {
        Self::with_config(StayOpenConfig::default())
    }

    /// Launches `executable`, sending `default_args` ahead of every request.
    ///
    /// # Example
    /// ```no_run
    /// # use exiftool_stayopen::{StayOpen, ExifToolError};
    /// # fn main() -> Result<(), ExifToolError> {
    /// let exiftool = StayOpen::start("exiftool", &["-json", "-g1"])?;
    /// let record = exiftool.extract("data/image.jpg")?;
    /// println!("{}", String::from_utf8_lossy(&record));
    /// # Ok(())
    /// # }
    /// ```
    pub fn start(
        executable: impl AsRef<Path>,
        default_args: &[&str],
    ) -> Result<Self, ExifToolError> {
        Self::with_config(StayOpenConfig::new(executable, default_args))
    }

    pub fn with_config(config: StayOpenConfig) -> Result<Self, ExifToolError> {
        let launch_error = |source| ExifToolError::Launch {
            executable: config.executable.clone(),
            source,
        };

        let child = Command::new(&config.executable)
            .arg("-stay_open")
            .arg("True")
            .arg("-@")
            .arg("-") // Read command args from stdin
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(launch_error)?;

        let pid = child.id();
        let process = Process::attach(child).map_err(launch_error)?;
        debug!(
            "Started {} in stay-open mode (pid {pid})",
            config.executable.display()
        );

        Ok(Self {
            config,
            pid,
            state: Mutex::new(State {
                process: Some(process),
                requests_served: 0,
            }),
        })
    }

    /// Runs the default arguments against `file_path` and returns the raw
    /// response.
    ///
    /// Runs `exiftool {default_args...} {file_path}`.
    pub fn extract(&self, file_path: impl AsRef<Path>) -> Result<Vec<u8>, ExifToolError> {
        self.extract_with_options(file_path, &[])
    }

    /// Like [`StayOpen::extract`], with `extra_args` placed after the default
    /// arguments.
    ///
    /// Runs `exiftool {default_args...} {extra_args...} {file_path}`.
    ///
    /// Per-file failures reported by ExifTool come back as
    /// [`ExifToolError::FileNotFound`] or [`ExifToolError::ExifTool`] and leave
    /// the process running. A broken pipe or an early end of output stops it
    /// for good.
    ///
    /// # Example
    /// ```no_run
    /// # use exiftool_stayopen::StayOpen;
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let exiftool = StayOpen::new()?;
    /// let json = exiftool.extract_with_options("data/image.jpg", &["-ShutterSpeed"])?;
    /// let value: serde_json::Value = serde_json::from_slice(&json)?;
    /// println!("{}", value[0]["ShutterSpeed"]);
    /// # Ok(())
    /// # }
    /// ```
    pub fn extract_with_options(
        &self,
        file_path: impl AsRef<Path>,
        extra_args: &[&str],
    ) -> Result<Vec<u8>, ExifToolError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let process = state.process.as_mut().ok_or(ExifToolError::Stopped)?;

        let request =
            framing::request_lines(&self.config.default_args, extra_args, file_path.as_ref())?;
        let command_args = request[..request.len() - 1].join(" ");
        let requested_file = request[request.len() - 2].clone();

        let result = process.round_trip(request).and_then(|frame| {
            state.requests_served += 1;
            let poll_timeout = if frame.is_empty() {
                // Failed files usually leave stdout empty; only then is it
                // worth waiting for stderr to catch up.
                self.config.stderr_poll_timeout
            } else {
                Duration::ZERO
            };
            check_response(
                frame,
                command_args,
                &requested_file,
                &process.stderr,
                poll_timeout,
            )
        });

        if let Err(err) = &result {
            if err.is_fatal() {
                debug!("exiftool (pid {}) failed mid-request: {err}", self.pid);
                if let Some(process) = state.process.take() {
                    self.shutdown(process);
                }
            }
        }
        result
    }

    /// Asks the process to leave stay-open mode and waits for it to exit.
    ///
    /// Waits for a request already in flight to finish first. If the process
    /// has not exited within the configured shutdown timeout it is killed.
    /// Calling `stop` again does nothing.
    pub fn stop(&self) {
        let mut state = self.lock();
        if let Some(process) = state.process.take() {
            self.shutdown(process);
            debug!("Stopped exiftool (pid {})", self.pid);
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().process.is_some()
    }

    /// Number of requests answered with a response, including responses
    /// that carried a per-file error.
    pub fn requests_served(&self) -> usize {
        self.lock().requests_served
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn config(&self) -> &StayOpenConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shutdown(&self, process: Process) {
        let Process {
            mut child,
            requests,
            responses,
            stderr,
            feeder,
            drainer,
            stderr_reader,
        } = process;

        // Closing the request channel makes the feeder send the shutdown
        // directive and close stdin.
        drop(requests);
        wait_or_kill(&mut child, self.config.shutdown_timeout);

        drop(responses);
        drop(stderr);
        for handle in [feeder, drainer, stderr_reader] {
            join(handle);
        }
    }
}

impl Drop for StayOpen {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Process {
    /// Takes the child's pipes and starts the threads that service them.
    /// The child is killed if any of that fails.
    fn attach(mut child: Child) -> std::io::Result<Self> {
        match Self::spawn_threads(&mut child) {
            Ok((requests, responses, stderr, [feeder, drainer, stderr_reader])) => Ok(Self {
                child,
                requests,
                responses,
                stderr,
                feeder,
                drainer,
                stderr_reader,
            }),
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn spawn_threads(
        child: &mut Child,
    ) -> std::io::Result<(
        Sender<Vec<String>>,
        Receiver<Response>,
        Receiver<String>,
        [JoinHandle<()>; 3],
    )> {
        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("Failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("Failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("Failed to capture stderr"))?;

        let (request_sender, request_receiver) = mpsc::channel();
        let (response_sender, response_receiver) = mpsc::channel();
        let (stderr_sender, stderr_receiver) = mpsc::channel();

        let feeder = {
            let responses = response_sender.clone();
            thread::Builder::new()
                .name(format!("exiftool-{pid}-stdin"))
                .spawn(move || feed(BufWriter::new(stdin), request_receiver, responses))?
        };
        let drainer = thread::Builder::new()
            .name(format!("exiftool-{pid}-stdout"))
            .spawn(move || drain(stdout, response_sender))?;
        let stderr_reader = thread::Builder::new()
            .name(format!("exiftool-{pid}-stderr"))
            .spawn(move || read_stderr(stderr, stderr_sender))?;

        Ok((
            request_sender,
            response_receiver,
            stderr_receiver,
            [feeder, drainer, stderr_reader],
        ))
    }

    /// Sends one request and waits for its response.
    fn round_trip(&mut self, request: Vec<String>) -> Response {
        // Drop stderr left over from earlier commands so it isn't blamed on this one.
        while self.stderr.try_recv().is_ok() {}

        self.requests
            .send(request)
            .map_err(|_| ExifToolError::ProcessTerminated)?;
        self.responses
            .recv()
            .unwrap_or(Err(ExifToolError::ProcessTerminated))
    }
}

/// Writes each request to stdin until the request channel closes, then
/// tells the process to exit.
fn feed(
    mut stdin: BufWriter<ChildStdin>,
    requests: Receiver<Vec<String>>,
    responses: Sender<Response>,
) {
    for lines in requests {
        if let Err(e) = write_lines(&mut stdin, &lines) {
            let _ = responses.send(Err(ExifToolError::Write(e)));
            return;
        }
    }

    if let Err(e) = write_lines(&mut stdin, &SHUTDOWN) {
        debug!("Could not send the shutdown directive: {e}");
    }
}

fn write_lines<S: AsRef<str>>(stdin: &mut impl Write, lines: &[S]) -> std::io::Result<()> {
    for line in lines {
        writeln!(stdin, "{}", line.as_ref())?;
    }
    stdin.flush()
}

/// Publishes every response found on stdout. The last message is always an
/// error: either the stream ended or it could not be read.
fn drain(stdout: ChildStdout, responses: Sender<Response>) {
    let mut frames = FrameReader::new(stdout);
    loop {
        let response = match frames.next_frame() {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(ExifToolError::ProcessTerminated),
            Err(e) => Err(e),
        };
        let last = response.is_err();
        if responses.send(response).is_err() || last {
            break;
        }
    }
}

fn read_stderr(stderr: ChildStderr, lines: Sender<String>) {
    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
        if lines.send(line).is_err() {
            // Receiver dropped, the process is being shut down.
            break;
        }
    }
}

/// Turns ExifTool's per-file complaints into errors.
///
/// ExifTool writes them to stderr before `{ready}`, or, with `-json`, as an
/// `Error` tag inside the record. A `File not found` line only counts when it
/// names `requested_file`; anything else is left over from an earlier
/// command. Other `Error:` lines carry no file name and are taken as they
/// come.
fn check_response(
    frame: Vec<u8>,
    command_args: String,
    requested_file: &str,
    stderr: &Receiver<String>,
    poll_timeout: Duration,
) -> Result<Vec<u8>, ExifToolError> {
    for err_line in collect_stderr(stderr, poll_timeout) {
        if let Some(filename) = err_line.strip_prefix("Error: File not found - ") {
            let filename = filename.trim();
            if filename != requested_file {
                debug!("Ignoring stale stderr line for {filename}: {err_line}");
                continue;
            }
            return Err(ExifToolError::FileNotFound {
                path: PathBuf::from(filename),
                command_args,
            });
        } else if err_line.contains("Error:") {
            return Err(ExifToolError::ExifTool {
                message: err_line,
                command_args,
                payload: frame,
            });
        } else if err_line.contains("Warning:") {
            warn!("ExifTool {err_line}. command={command_args}");
        }
    }

    if let Some(message) = json_record_error(&frame) {
        return Err(ExifToolError::ExifTool {
            message,
            command_args,
            payload: frame,
        });
    }
    Ok(frame)
}

/// Collects the stderr lines available now, polling up to `poll_timeout`
/// for the first one to show up.
fn collect_stderr(receiver: &Receiver<String>, poll_timeout: Duration) -> Vec<String> {
    let start_time = Instant::now();
    let mut err_lines = Vec::new();

    loop {
        match receiver.try_recv() {
            Ok(line) => err_lines.push(line),
            Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {
                // Errors arrive in a burst; once some are in, the burst is over.
                if !err_lines.is_empty() || start_time.elapsed() >= poll_timeout {
                    break;
                }
                thread::sleep(STDERR_POLL_INTERVAL);
            }
        }
    }
    err_lines
}

fn wait_or_kill(child: &mut Child, timeout: Duration) {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("exiftool (pid {}) exited with {status}", child.id());
                return;
            }
            Ok(None) if start.elapsed() < timeout => thread::sleep(EXIT_POLL_INTERVAL),
            Ok(None) => {
                warn!(
                    "exiftool (pid {}) still running {timeout:?} after shutdown, killing it",
                    child.id()
                );
                break;
            }
            Err(e) => {
                warn!("Could not poll exiftool (pid {}): {e}", child.id());
                break;
            }
        }
    }

    let _ = child.kill();
    let _ = child.wait();
}

fn join(handle: JoinHandle<()>) {
    let name = handle.thread().name().unwrap_or("exiftool").to_string();
    if handle.join().is_err() {
        warn!("Background thread {name} panicked");
    }
}
