//! Driving a terminal board application through a pseudo-terminal.
//!
//! The target runs inside a PTY sized from the environment profile. Its
//! output is fed through a small VT100 screen model; every `[d]` token on the
//! screen, in reading order, is one actionable element. A click types the
//! element's position followed by Enter.
//!
//! Every wait is bounded: output is drained until the screen has been quiet
//! for [`QUIET_WINDOW`] or a per-step ceiling is reached.

use font8x8::{BASIC_FONTS, UnicodeFonts};
use image::{ImageBuffer, Rgb, RgbImage};
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Cursor, ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use vte::{Params, Parser as AnsiParser, Perform};

use super::types::{DriverError, DriverResult, Element, ElementSnapshot, EnvironmentProfile, MAX_DIMENSION, Screenshot};
use super::{AutomationDriver, SessionFactory};

const FONT_WIDTH: u32 = 8;
const FONT_HEIGHT: u32 = 16;
const PIXEL_SCALE: u32 = 2;
/// Width of a terminal cell in pixels
pub const CELL_WIDTH: u32 = FONT_WIDTH * PIXEL_SCALE;
/// Height of a terminal cell in pixels
pub const CELL_HEIGHT: u32 = FONT_HEIGHT * PIXEL_SCALE;

const MIN_COLS: u16 = 20;
const MIN_ROWS: u16 = 6;

pub const QUIET_WINDOW: Duration = Duration::from_millis(180);
const MAX_INITIAL_RENDER_WAIT: Duration = Duration::from_secs(3);
const MAX_INPUT_RENDER_WAIT: Duration = Duration::from_secs(2);
const PROCESS_EXIT_WAIT: Duration = Duration::from_secs(3);

const FG: [u8; 3] = [229, 229, 229];
const BG: [u8; 3] = [0, 0, 0];

/// Character grid driven by VT100 output
#[derive(Debug, Clone)]
pub struct Screen {
    cols: usize,
    rows: usize,
    cells: Vec<Vec<char>>,
    cursor_x: usize,
    cursor_y: usize,
}

impl Screen {
    pub fn new(cols: usize, rows: usize) -> Self {
        let cols = cols.max(1);
        let rows = rows.max(1);
        Self {
            cols,
            rows,
            cells: vec![vec![' '; cols]; rows],
            cursor_x: 0,
            cursor_y: 0,
        }
    }

    pub fn clear(&mut self) {
        for row in &mut self.cells {
            row.fill(' ');
        }
        self.cursor_x = 0;
        self.cursor_y = 0;
    }

    fn put(&mut self, ch: char) {
        if self.cursor_x >= self.cols {
            self.cursor_x = 0;
            self.line_feed();
        }
        self.cells[self.cursor_y][self.cursor_x] = ch;
        self.cursor_x += 1;
    }

    fn line_feed(&mut self) {
        if self.cursor_y + 1 < self.rows {
            self.cursor_y += 1;
        } else {
            self.cells.remove(0);
            self.cells.push(vec![' '; self.cols]);
        }
    }

    fn move_to(&mut self, x: usize, y: usize) {
        self.cursor_x = x.min(self.cols - 1);
        self.cursor_y = y.min(self.rows - 1);
    }

    fn move_by(&mut self, dx: i64, dy: i64) {
        let x = (self.cursor_x as i64 + dx).max(0) as usize;
        let y = (self.cursor_y as i64 + dy).max(0) as usize;
        self.move_to(x, y);
    }

    fn clear_line_from_cursor(&mut self) {
        let y = self.cursor_y;
        for x in self.cursor_x.min(self.cols)..self.cols {
            self.cells[y][x] = ' ';
        }
    }

    fn clear_from_cursor(&mut self) {
        self.clear_line_from_cursor();
        for row in self.cells.iter_mut().skip(self.cursor_y + 1) {
            row.fill(' ');
        }
    }

    /// Visible text, one line per row with trailing blanks trimmed
    pub fn text(&self) -> String {
        self.cells
            .iter()
            .map(|row| row.iter().collect::<String>().trim_end().to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Values of every `[d]` token, in reading order
    pub fn board_values(&self) -> Vec<String> {
        let mut values = Vec::new();
        for row in &self.cells {
            let line: String = row.iter().collect();
            let mut rest = line.as_str();
            while let Some(open) = rest.find('[') {
                let after = &rest[open + 1..];
                match after.find(']') {
                    Some(close) if close > 0 && after[..close].chars().all(|c| c.is_ascii_digit()) => {
                        values.push(after[..close].to_string());
                        rest = &after[close + 1..];
                    }
                    _ => rest = after,
                }
            }
        }
        values
    }

    /// Draw the grid with font8x8 glyphs, each row doubled and scaled
    pub fn render(&self) -> RgbImage {
        let width = self.cols as u32 * CELL_WIDTH;
        let height = self.rows as u32 * CELL_HEIGHT;
        let mut img = ImageBuffer::from_pixel(width, height, Rgb(BG));

        for (y, row) in self.cells.iter().enumerate() {
            for (x, ch) in row.iter().enumerate() {
                if *ch == ' ' {
                    continue;
                }
                let glyph = BASIC_FONTS.get(*ch).unwrap_or([0u8; 8]);
                for py in 0..FONT_HEIGHT {
                    let bits = glyph[(py / 2) as usize];
                    for px in 0..FONT_WIDTH {
                        if (bits >> px) & 1 == 0 {
                            continue;
                        }
                        for sy in 0..PIXEL_SCALE {
                            for sx in 0..PIXEL_SCALE {
                                let ix = x as u32 * CELL_WIDTH + px * PIXEL_SCALE + sx;
                                let iy = y as u32 * CELL_HEIGHT + py * PIXEL_SCALE + sy;
                                img.put_pixel(ix, iy, Rgb(FG));
                            }
                        }
                    }
                }
            }
        }
        img
    }
}

struct ScreenPerformer<'a> {
    screen: &'a mut Screen,
}

impl ScreenPerformer<'_> {
    fn param_or(params: &Params, index: usize, default: u16) -> u16 {
        params
            .iter()
            .nth(index)
            .and_then(|p| p.first())
            .copied()
            .filter(|v| *v != 0)
            .unwrap_or(default)
    }
}

impl Perform for ScreenPerformer<'_> {
    fn print(&mut self, c: char) {
        self.screen.put(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' => self.screen.line_feed(),
            b'\r' => self.screen.cursor_x = 0,
            0x08 => self.screen.cursor_x = self.screen.cursor_x.saturating_sub(1),
            _ => {}
        }
    }

    fn csi_dispatch(&mut self, params: &Params, _intermediates: &[u8], _ignore: bool, action: char) {
        let n = i64::from(Self::param_or(params, 0, 1));
        match action {
            'H' | 'f' => {
                let row = Self::param_or(params, 0, 1).saturating_sub(1);
                let col = Self::param_or(params, 1, 1).saturating_sub(1);
                self.screen.move_to(usize::from(col), usize::from(row));
            }
            'A' => self.screen.move_by(0, -n),
            'B' => self.screen.move_by(0, n),
            'C' => self.screen.move_by(n, 0),
            'D' => self.screen.move_by(-n, 0),
            'G' => {
                let col = Self::param_or(params, 0, 1).saturating_sub(1);
                let y = self.screen.cursor_y;
                self.screen.move_to(usize::from(col), y);
            }
            'J' => match Self::param_or(params, 0, 0) {
                0 => self.screen.clear_from_cursor(),
                2 | 3 => {
                    let (x, y) = (self.screen.cursor_x, self.screen.cursor_y);
                    self.screen.clear();
                    self.screen.move_to(x, y);
                }
                _ => {}
            },
            'K' => self.screen.clear_line_from_cursor(),
            _ => {}
        }
    }

    fn esc_dispatch(&mut self, _intermediates: &[u8], _ignore: bool, byte: u8) {
        if byte == b'c' {
            self.screen.clear();
        }
    }
}

/// Screen model plus the ANSI state machine feeding it
pub struct ScreenParser {
    screen: Screen,
    parser: AnsiParser,
}

impl ScreenParser {
    pub fn new(cols: usize, rows: usize) -> Self {
        Self {
            screen: Screen::new(cols, rows),
            parser: AnsiParser::new(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        let mut performer = ScreenPerformer {
            screen: &mut self.screen,
        };
        for &byte in bytes {
            self.parser.advance(&mut performer, byte);
        }
    }

    pub fn screen(&self) -> &Screen {
        &self.screen
    }
}

/// Launches a terminal board application per session
#[derive(Debug, Clone)]
pub struct PtySessionFactory {
    binary: PathBuf,
    args: Vec<String>,
}

impl PtySessionFactory {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Terminal size for a pixel viewport, capped so screenshots stay within [`MAX_DIMENSION`]
    pub fn terminal_size(environment: &EnvironmentProfile) -> (u16, u16) {
        let cols = (environment.width / CELL_WIDTH).clamp(u32::from(MIN_COLS), MAX_DIMENSION / CELL_WIDTH) as u16;
        let rows = (environment.height / CELL_HEIGHT).clamp(u32::from(MIN_ROWS), MAX_DIMENSION / CELL_HEIGHT) as u16;
        (cols, rows)
    }
}

impl SessionFactory for PtySessionFactory {
    fn open_session(&self, environment: &EnvironmentProfile) -> DriverResult<Box<dyn AutomationDriver>> {
        let (cols, rows) = Self::terminal_size(environment);
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = native_pty_system()
            .openpty(size)
            .map_err(|e| DriverError::SessionSetup(format!("failed to open PTY: {}", e)))?;

        let binary = self.binary.to_string_lossy().to_string();
        let mut cmd = CommandBuilder::new(&binary);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLUMNS", cols.to_string());
        cmd.env("LINES", rows.to_string());
        for arg in &self.args {
            cmd.arg(arg);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| DriverError::SessionSetup(format!("failed to spawn '{}': {}", binary, e)))?;
        drop(pair.slave);

        let io = pair
            .master
            .try_clone_reader()
            .map_err(|e| DriverError::SessionSetup(format!("failed to clone PTY reader: {}", e)))
            .and_then(|reader| {
                pair.master
                    .take_writer()
                    .map(|writer| (reader, writer))
                    .map_err(|e| DriverError::SessionSetup(format!("failed to take PTY writer: {}", e)))
            });
        let (reader, writer) = reap_on_error(child.as_mut(), io)?;

        let mut driver = PtyDriver {
            parser: ScreenParser::new(usize::from(cols), usize::from(rows)),
            rx: spawn_reader(reader),
            writer,
            child,
            _master: pair.master,
            closed: false,
        };
        driver.drain(MAX_INITIAL_RENDER_WAIT);
        debug!(binary = %binary, cols, rows, "terminal session ready");
        Ok(Box::new(driver))
    }
}

/// One running terminal application
pub struct PtyDriver {
    parser: ScreenParser,
    rx: Receiver<Vec<u8>>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    _master: Box<dyn MasterPty + Send>,
    closed: bool,
}

impl PtyDriver {
    fn ensure_open(&self) -> DriverResult<()> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        Ok(())
    }

    /// Feed output until quiet or `max_wait` elapses
    fn drain(&mut self, max_wait: Duration) {
        let start = Instant::now();
        let mut last_activity = Instant::now();

        while start.elapsed() < max_wait {
            match self.rx.recv_timeout(Duration::from_millis(50)) {
                Ok(chunk) => {
                    self.parser.feed(&chunk);
                    last_activity = Instant::now();
                }
                Err(RecvTimeoutError::Timeout) => {
                    if last_activity.elapsed() >= QUIET_WINDOW {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        while let Ok(chunk) = self.rx.try_recv() {
            self.parser.feed(&chunk);
        }
    }

    fn send(&mut self, bytes: &[u8]) -> DriverResult<()> {
        self.writer
            .write_all(bytes)
            .and_then(|_| self.writer.flush())
            .map_err(|e| DriverError::Action(format!("failed to write to terminal: {}", e)))
    }
}

impl AutomationDriver for PtyDriver {
    fn capture_snapshot(&mut self) -> DriverResult<ElementSnapshot> {
        self.ensure_open()?;
        self.drain(MAX_INPUT_RENDER_WAIT);
        Ok(ElementSnapshot::from_values(self.parser.screen().board_values()))
    }

    fn click(&mut self, element: &Element) -> DriverResult<()> {
        self.ensure_open()?;
        self.drain(MAX_INPUT_RENDER_WAIT);

        let live = self.parser.screen().board_values();
        if live.get(element.position) != Some(&element.text) {
            return Err(DriverError::ElementNotFound {
                text: element.text.clone(),
                position: element.position,
            });
        }

        self.send(format!("{}\r", element.position).as_bytes())?;
        self.drain(MAX_INPUT_RENDER_WAIT);
        Ok(())
    }

    fn screenshot(&mut self) -> DriverResult<Screenshot> {
        self.ensure_open()?;
        let img = self.parser.screen().render();
        let (width, height) = img.dimensions();
        let mut png = Vec::new();
        img.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .map_err(|e| DriverError::Screenshot(format!("failed to encode PNG: {}", e)))?;
        Ok(Screenshot { png, width, height })
    }

    fn close(&mut self) -> DriverResult<()> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        self.closed = true;

        let _ = self.send(b"q");
        let start = Instant::now();
        while start.elapsed() < PROCESS_EXIT_WAIT {
            match self.child.try_wait() {
                Ok(Some(_)) => return Ok(()),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "failed to poll terminal application");
                    break;
                }
            }
            let _ = self.rx.recv_timeout(Duration::from_millis(60));
        }

        self.child.kill()?;
        let _ = self.child.wait();
        Ok(())
    }
}

impl Drop for PtyDriver {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Kill `child` when `result` failed, so a half-built session leaves no process behind
fn reap_on_error<T>(child: &mut (dyn Child + Send + Sync), result: DriverResult<T>) -> DriverResult<T> {
    if result.is_err() {
        if let Err(e) = child.kill() {
            warn!(error = %e, "failed to kill terminal application");
        }
        let _ = child.wait();
    }
    result
}

fn spawn_reader(mut reader: Box<dyn Read + Send>) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buffer = [0u8; 4096];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(size) => {
                    if tx.send(buffer[..size].to_vec()).is_err() {
                        break;
                    }
                }
                Err(err) => match err.kind() {
                    ErrorKind::Interrupted => continue,
                    ErrorKind::WouldBlock => thread::sleep(Duration::from_millis(10)),
                    _ => break,
                },
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_screen_reads_board_tokens_in_reading_order() {
        let mut parser = ScreenParser::new(40, 6);
        parser.feed(b"\x1b[2J\x1b[1;1HSum Link\r\n[8] [1] [9] [8]\r\n[3]  .  [7] [10]\r\nPick> ");
        assert_eq!(parser.screen().board_values(), vec!["8", "1", "9", "8", "3", "7", "10"]);
    }

    #[test]
    fn test_screen_ignores_non_numeric_brackets() {
        let mut parser = ScreenParser::new(40, 3);
        parser.feed(b"[q]uit [] [12a] [4]");
        assert_eq!(parser.screen().board_values(), vec!["4"]);
    }

    #[test]
    fn test_cursor_positioning_overwrites() {
        let mut parser = ScreenParser::new(10, 3);
        parser.feed(b"[1] [2]\x1b[1;5H   ");
        assert_eq!(parser.screen().board_values(), vec!["1"]);
        assert_eq!(parser.screen().text().lines().next(), Some("[1]"));
    }

    #[test]
    fn test_scrolls_at_bottom() {
        let mut parser = ScreenParser::new(10, 2);
        parser.feed(b"a\r\nb\r\nc");
        assert_eq!(parser.screen().text(), "b\nc");
    }

    #[test]
    fn test_render_dimensions() {
        let parser = ScreenParser::new(20, 6);
        let img = parser.screen().render();
        assert_eq!(img.dimensions(), (20 * CELL_WIDTH, 6 * CELL_HEIGHT));
    }

    #[test]
    fn test_terminal_size_from_profile() {
        assert_eq!(PtySessionFactory::terminal_size(&EnvironmentProfile::desktop()), (120, 33));
        assert_eq!(PtySessionFactory::terminal_size(&EnvironmentProfile::mobile()), (23, 25));
        assert_eq!(
            PtySessionFactory::terminal_size(&EnvironmentProfile::new("Tiny", 10, 10)),
            (MIN_COLS, MIN_ROWS)
        );
        assert_eq!(
            PtySessionFactory::terminal_size(&EnvironmentProfile::new("Wall", 40_000, 40_000)),
            (512, 256)
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_setup_kills_the_child() {
        let pair = native_pty_system().openpty(PtySize::default()).unwrap();
        let mut cmd = CommandBuilder::new("sleep");
        cmd.arg("30");
        let mut child = pair.slave.spawn_command(cmd).unwrap();

        let result = reap_on_error(child.as_mut(), Err::<(), _>(DriverError::SessionSetup("no writer".into())));
        assert!(result.is_err());
        assert!(child.try_wait().unwrap().is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_successful_setup_keeps_the_child() {
        let pair = native_pty_system().openpty(PtySize::default()).unwrap();
        let mut cmd = CommandBuilder::new("sleep");
        cmd.arg("30");
        let mut child = pair.slave.spawn_command(cmd).unwrap();

        assert!(reap_on_error(child.as_mut(), Ok(())).is_ok());
        assert!(child.try_wait().unwrap().is_none());
        child.kill().unwrap();
        let _ = child.wait();
    }
}
