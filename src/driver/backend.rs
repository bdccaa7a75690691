//! In-process board game driver and the framebuffer used to draw it.
//!
//! [`SimulatedSessionFactory`] hands out sessions over a fresh copy of a fixed
//! board. The game applies the identical-or-sum-to-10 rule, and can be told to
//! misbehave so failure paths can be exercised without a real application:
//! - refuse to open sessions
//! - change the board right after a snapshot is taken
//! - ignore valid pairs (a defective build)

use font8x8::{BASIC_FONTS, UnicodeFonts};
use image::{ImageBuffer, RgbImage};
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use super::types::{DriverError, DriverResult, Element, ElementSnapshot, EnvironmentProfile, MAX_DIMENSION, Screenshot};
use super::{AutomationDriver, SessionFactory};
use crate::matcher::{MatchPredicate, SumOrIdentical};

const BACKGROUND: [u8; 3] = [24, 26, 33];
const CELL_FILL: [u8; 3] = [52, 58, 74];
const CELL_SELECTED: [u8; 3] = [196, 160, 0];
const CELL_CLEARED: [u8; 3] = [32, 34, 40];
const TEXT: [u8; 3] = [235, 235, 235];

/// Largest canvas a framebuffer will allocate
pub const MAX_FRAMEBUFFER_PIXELS: u64 = MAX_DIMENSION as u64 * MAX_DIMENSION as u64;

/// The board every simulated session starts from unless told otherwise
pub const DEFAULT_BOARD: [u8; 16] = [8, 1, 9, 8, 3, 7, 5, 5, 2, 4, 6, 1, 9, 9, 3, 2];

/// Columns of the default board
pub const DEFAULT_COLUMNS: usize = 4;

/// An RGB canvas with just enough drawing to render boards
#[derive(Debug, Clone)]
pub struct MockFramebuffer {
    width: u32,
    height: u32,
    /// RGB pixel buffer (row-major, 3 bytes per pixel)
    buffer: Vec<u8>,
}

impl MockFramebuffer {
    /// Create a framebuffer initialized to `color`.
    ///
    /// Fails for canvases above [`MAX_FRAMEBUFFER_PIXELS`].
    pub fn with_color(width: u32, height: u32, color: [u8; 3]) -> DriverResult<Self> {
        let pixels = u64::from(width) * u64::from(height);
        if pixels > MAX_FRAMEBUFFER_PIXELS {
            return Err(DriverError::Screenshot(format!(
                "{}x{} exceeds the {} pixel canvas limit",
                width, height, MAX_FRAMEBUFFER_PIXELS
            )));
        }
        let len = usize::try_from(pixels * 3)
            .map_err(|_| DriverError::Screenshot(format!("{}x{} does not fit in memory", width, height)))?;
        let buffer = color.iter().copied().cycle().take(len).collect();
        Ok(Self { width, height, buffer })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Draw a filled rectangle, clipped to the canvas
    pub fn draw_rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: [u8; 3]) {
        for py in y..(y.saturating_add(h)).min(self.height) {
            for px in x..(x.saturating_add(w)).min(self.width) {
                self.set_pixel(px, py, color);
            }
        }
    }

    /// Draw text with font8x8 glyphs, each pixel blown up to `scale`x`scale`
    pub fn draw_text(&mut self, x: u32, y: u32, text: &str, scale: u32, fg: [u8; 3]) {
        let scale = scale.max(1);
        let mut cursor_x = x;
        for ch in text.chars() {
            let glyph = BASIC_FONTS.get(ch).unwrap_or([0u8; 8]);
            for (row_idx, row) in glyph.iter().enumerate() {
                for bit in 0..8u32 {
                    // font8x8 stores LSB as leftmost pixel
                    if (row >> bit) & 1 == 1 {
                        let px = cursor_x + bit * scale;
                        let py = y + row_idx as u32 * scale;
                        self.draw_rect(px, py, scale, scale, fg);
                    }
                }
            }
            cursor_x += 8 * scale;
            if cursor_x >= self.width {
                break;
            }
        }
    }

    pub fn get_pixel(&self, x: u32, y: u32) -> [u8; 3] {
        if x >= self.width || y >= self.height {
            return [0, 0, 0];
        }
        let idx = self.offset(x, y);
        [self.buffer[idx], self.buffer[idx + 1], self.buffer[idx + 2]]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, color: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = self.offset(x, y);
        self.buffer[idx..idx + 3].copy_from_slice(&color);
    }

    /// Byte offset of an in-bounds pixel
    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * 3
    }

    /// Encode as PNG
    pub fn to_png(&self) -> DriverResult<Vec<u8>> {
        let img: RgbImage = ImageBuffer::from_raw(self.width, self.height, self.buffer.clone())
            .ok_or_else(|| DriverError::Screenshot("framebuffer size does not match dimensions".to_string()))?;
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .map_err(|e| DriverError::Screenshot(format!("failed to encode PNG: {}", e)))?;
        Ok(bytes)
    }

    pub fn into_screenshot(self) -> DriverResult<Screenshot> {
        Ok(Screenshot {
            png: self.to_png()?,
            width: self.width,
            height: self.height,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cell {
    value: u8,
    cleared: bool,
}

/// A number-matching board.
///
/// Clicks address cells by their rank among the cells still on the board, the
/// same positions a snapshot reports.
#[derive(Debug, Clone)]
pub struct SimulatedBoard {
    cells: Vec<Cell>,
    columns: usize,
    /// Index into `cells` of the first half of a pending pair
    selected: Option<usize>,
    defective: bool,
}

impl SimulatedBoard {
    pub fn new(values: &[u8], columns: usize) -> Self {
        Self {
            cells: values.iter().map(|&value| Cell { value, cleared: false }).collect(),
            columns: columns.max(1),
            selected: None,
            defective: false,
        }
    }

    /// Values still on the board, in reading order
    pub fn values(&self) -> Vec<String> {
        self.cells
            .iter()
            .filter(|c| !c.cleared)
            .map(|c| c.value.to_string())
            .collect()
    }

    pub fn remaining(&self) -> usize {
        self.cells.iter().filter(|c| !c.cleared).count()
    }

    fn active_index(&self, position: usize) -> Option<usize> {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.cleared)
            .nth(position)
            .map(|(i, _)| i)
    }

    /// Select the cell at `position`; a second selection resolves the pair.
    ///
    /// Returns `true` when the click removed a pair.
    pub fn click(&mut self, position: usize) -> Option<bool> {
        let index = self.active_index(position)?;

        let Some(first) = self.selected.take() else {
            self.selected = Some(index);
            return Some(false);
        };
        if first == index {
            return Some(false);
        }

        let a = Element::new(self.cells[first].value.to_string(), 0);
        let b = Element::new(self.cells[index].value.to_string(), 1);
        let valid = SumOrIdentical::default().classify(&a, &b).is_some();
        if valid && !self.defective {
            self.cells[first].cleared = true;
            self.cells[index].cleared = true;
            return Some(true);
        }
        Some(false)
    }

    /// Remove the first cell still on the board, as if someone else moved
    fn disturb(&mut self) {
        if let Some(index) = self.active_index(0) {
            self.cells[index].cleared = true;
            self.selected = None;
        }
    }

    /// Draw the board into a `width`x`height` PNG
    pub fn render(&self, width: u32, height: u32) -> DriverResult<Screenshot> {
        let mut fb = MockFramebuffer::with_color(width, height, BACKGROUND)?;

        let rows = self.cells.len().div_ceil(self.columns).max(1) as u32;
        let columns = self.columns as u32;
        let pitch = (width / columns).min(height / rows).max(4);
        let gap = (pitch / 10).max(1);
        let origin_x = width.saturating_sub(pitch * columns) / 2;
        let origin_y = height.saturating_sub(pitch * rows) / 2;
        let scale = (pitch / 16).max(1);

        for (i, cell) in self.cells.iter().enumerate() {
            let x = origin_x + (i % self.columns) as u32 * pitch + gap;
            let y = origin_y + (i / self.columns) as u32 * pitch + gap;
            let size = pitch - 2 * gap;

            let fill = if cell.cleared {
                CELL_CLEARED
            } else if self.selected == Some(i) {
                CELL_SELECTED
            } else {
                CELL_FILL
            };
            fb.draw_rect(x, y, size, size, fill);

            if !cell.cleared {
                let glyph = 8 * scale;
                let tx = x + size.saturating_sub(glyph) / 2;
                let ty = y + size.saturating_sub(glyph) / 2;
                fb.draw_text(tx, ty, &cell.value.to_string(), scale, TEXT);
            }
        }

        fb.into_screenshot()
    }
}

/// Ways a simulated session can misbehave
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Faults {
    /// Every `open_session` fails
    pub setup_failure: bool,
    /// The board changes once, right after the first snapshot
    pub disturb_after_capture: bool,
    /// Valid pairs are not removed
    pub ignore_matches: bool,
}

/// One session over a private board
pub struct SimulatedDriver {
    board: SimulatedBoard,
    environment: EnvironmentProfile,
    faults: Faults,
    disturbed: bool,
    open: Option<Arc<AtomicUsize>>,
}

impl SimulatedDriver {
    pub fn board(&self) -> &SimulatedBoard {
        &self.board
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if self.open.is_none() {
            return Err(DriverError::Closed);
        }
        Ok(())
    }
}

impl AutomationDriver for SimulatedDriver {
    fn capture_snapshot(&mut self) -> DriverResult<ElementSnapshot> {
        self.ensure_open()?;
        let snapshot = ElementSnapshot::from_values(self.board.values());

        if self.faults.disturb_after_capture && !self.disturbed {
            self.disturbed = true;
            self.board.disturb();
            debug!(snapshot = %snapshot.id, "board disturbed after capture");
        }
        Ok(snapshot)
    }

    fn click(&mut self, element: &Element) -> DriverResult<()> {
        self.ensure_open()?;
        let live = self.board.values();
        if live.get(element.position) != Some(&element.text) {
            return Err(DriverError::ElementNotFound {
                text: element.text.clone(),
                position: element.position,
            });
        }
        self.board
            .click(element.position)
            .map(|_| ())
            .ok_or_else(|| DriverError::Action(format!("no cell at position {}", element.position)))
    }

    fn screenshot(&mut self) -> DriverResult<Screenshot> {
        self.ensure_open()?;
        self.board.render(self.environment.width, self.environment.height)
    }

    fn close(&mut self) -> DriverResult<()> {
        match self.open.take() {
            Some(counter) => {
                counter.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(DriverError::Closed),
        }
    }
}

impl Drop for SimulatedDriver {
    fn drop(&mut self) {
        if let Some(counter) = self.open.take() {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Opens [`SimulatedDriver`] sessions over copies of one starting board
#[derive(Debug, Clone)]
pub struct SimulatedSessionFactory {
    values: Vec<u8>,
    columns: usize,
    faults: Faults,
    opened: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl SimulatedSessionFactory {
    pub fn new(values: &[u8], columns: usize) -> Self {
        Self {
            values: values.to_vec(),
            columns,
            faults: Faults::default(),
            opened: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    /// Sessions opened so far
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Sessions currently open
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Most sessions ever open at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// A fresh board as sessions see it
    pub fn board(&self) -> SimulatedBoard {
        let mut board = SimulatedBoard::new(&self.values, self.columns);
        board.defective = self.faults.ignore_matches;
        board
    }
}

impl Default for SimulatedSessionFactory {
    fn default() -> Self {
        Self::new(&DEFAULT_BOARD, DEFAULT_COLUMNS)
    }
}

impl SessionFactory for SimulatedSessionFactory {
    fn open_session(&self, environment: &EnvironmentProfile) -> DriverResult<Box<dyn AutomationDriver>> {
        if self.faults.setup_failure {
            return Err(DriverError::SessionSetup(format!(
                "simulated browser refused to start at {}",
                environment.resolution()
            )));
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        Ok(Box::new(SimulatedDriver {
            board: self.board(),
            environment: environment.clone(),
            faults: self.faults,
            disturbed: false,
            open: Some(self.active.clone()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> EnvironmentProfile {
        EnvironmentProfile::new("Small", 160, 160)
    }

    #[test]
    fn test_board_removes_valid_pairs() {
        let mut board = SimulatedBoard::new(&[8, 1, 9, 8], 4);
        assert_eq!(board.click(0), Some(false));
        assert_eq!(board.click(3), Some(true));
        assert_eq!(board.values(), vec!["1", "9"]);

        // Positions are re-ranked after removal
        assert_eq!(board.click(0), Some(false));
        assert_eq!(board.click(1), Some(true));
        assert_eq!(board.remaining(), 0);
    }

    #[test]
    fn test_board_rejects_invalid_pairs() {
        let mut board = SimulatedBoard::new(&[8, 1, 9, 8], 4);
        board.click(0);
        assert_eq!(board.click(1), Some(false));
        assert_eq!(board.remaining(), 4);
        assert_eq!(board.click(9), None);
    }

    #[test]
    fn test_click_checks_live_board() {
        let factory = SimulatedSessionFactory::new(&[8, 1, 9, 8], 4).with_faults(Faults {
            disturb_after_capture: true,
            ..Faults::default()
        });
        let mut driver = factory.open_session(&small()).unwrap();
        let snapshot = driver.capture_snapshot().unwrap();

        let err = driver.click(&snapshot.elements[0]).unwrap_err();
        assert!(matches!(err, DriverError::ElementNotFound { position: 0, .. }));
        driver.close().unwrap();
    }

    #[test]
    fn test_session_accounting() {
        let factory = SimulatedSessionFactory::default();
        let mut a = factory.open_session(&small()).unwrap();
        {
            let _b = factory.open_session(&small()).unwrap();
            assert_eq!(factory.active(), 2);
        }
        assert_eq!(factory.active(), 1);
        a.close().unwrap();
        assert!(matches!(a.close(), Err(DriverError::Closed)));
        assert!(matches!(a.capture_snapshot(), Err(DriverError::Closed)));
        assert_eq!(factory.active(), 0);
        assert_eq!(factory.opened(), 2);
        assert_eq!(factory.peak(), 2);
    }

    #[test]
    fn test_setup_failure() {
        let factory = SimulatedSessionFactory::default().with_faults(Faults {
            setup_failure: true,
            ..Faults::default()
        });
        assert!(matches!(
            factory.open_session(&small()),
            Err(DriverError::SessionSetup(_))
        ));
        assert_eq!(factory.active(), 0);
    }

    #[test]
    fn test_defective_board_keeps_pairs() {
        let factory = SimulatedSessionFactory::new(&[5, 5], 2).with_faults(Faults {
            ignore_matches: true,
            ..Faults::default()
        });
        let mut driver = factory.open_session(&small()).unwrap();
        let snapshot = driver.capture_snapshot().unwrap();
        driver.click(&snapshot.elements[0]).unwrap();
        driver.click(&snapshot.elements[1]).unwrap();
        assert_eq!(driver.capture_snapshot().unwrap().values(), vec!["5", "5"]);
    }

    #[test]
    fn test_render_board_png() {
        let board = SimulatedBoard::new(&DEFAULT_BOARD, DEFAULT_COLUMNS);
        let shot = board.render(200, 120).unwrap();
        assert_eq!((shot.width, shot.height), (200, 120));
        assert_eq!(&shot.png[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn test_framebuffer_draw_text() {
        let mut fb = MockFramebuffer::with_color(32, 16, [0, 0, 0]).unwrap();
        fb.draw_text(0, 0, "8", 2, [255, 255, 255]);
        let lit = (0..16)
            .flat_map(|x| (0..16).map(move |y| (x, y)))
            .filter(|&(x, y)| fb.get_pixel(x, y) == [255, 255, 255])
            .count();
        assert!(lit > 0);
        assert_eq!(fb.get_pixel(31, 15), [0, 0, 0]);
    }

    #[test]
    fn test_oversized_canvas_is_an_error() {
        let err = MockFramebuffer::with_color(40_000, 40_000, [0, 0, 0]).unwrap_err();
        assert!(matches!(err, DriverError::Screenshot(_)));

        let board = SimulatedBoard::new(&[8, 1, 9, 8], 4);
        assert!(board.render(u32::MAX, u32::MAX).is_err());
    }
}
