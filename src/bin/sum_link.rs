//! # Sum Link
//!
//! A small number-matching puzzle for the terminal, used as a target for
//! `board-explorer cycle --target`. Two cells are removed together when they
//! hold the same number or their numbers add up to 10.
//!
//! Cells still on the board are drawn as `[d]`; removed cells leave a blank
//! gap. A cell is addressed by its position among the cells still on the
//! board: type the position and press Enter. The first selection is
//! highlighted; the second resolves the pair. `q` or Esc quits.

use anyhow::bail;
use clap::{Arg, Command};
use crossterm::{
    cursor::{Hide, MoveTo, Show},
    event::{self, Event, KeyCode, KeyEventKind},
    execute, queue,
    style::{Attribute, Print, SetAttribute},
    terminal::{self, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen},
};
use std::io::{Write, stdout};

const DEFAULT_BOARD: &str = "8,1,9,8,3,7,5,5,2,4,6,1,9,9,3,2";
const MATCH_SUM: u8 = 10;

/// Game state
struct Game {
    /// `None` once removed
    cells: Vec<Option<u8>>,
    columns: usize,
    /// Index into `cells` of the pending first selection
    selected: Option<usize>,
    /// Digits typed since the last Enter
    input: String,
    removed_pairs: usize,
    message: String,
}

impl Game {
    fn new(values: Vec<u8>, columns: usize) -> Self {
        Self {
            cells: values.into_iter().map(Some).collect(),
            columns: columns.max(1),
            selected: None,
            input: String::new(),
            removed_pairs: 0,
            message: "Type a position and press Enter".to_string(),
        }
    }

    fn remaining(&self) -> usize {
        self.cells.iter().flatten().count()
    }

    fn index_of(&self, position: usize) -> Option<usize> {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_some())
            .nth(position)
            .map(|(i, _)| i)
    }

    fn submit(&mut self) {
        let input = std::mem::take(&mut self.input);
        let Ok(position) = input.parse::<usize>() else {
            return;
        };
        let Some(index) = self.index_of(position) else {
            self.message = format!("No cell at position {}", position);
            return;
        };
        self.select(index, position);
    }

    fn select(&mut self, index: usize, position: usize) {
        let Some(value) = self.cells[index] else {
            return;
        };

        let Some(first) = self.selected.take() else {
            self.selected = Some(index);
            self.message = format!("Selected {} at position {}", value, position);
            return;
        };
        if first == index {
            self.message = "Selection cleared".to_string();
            return;
        }

        let Some(other) = self.cells[first] else {
            return;
        };
        if other == value || other + value == MATCH_SUM {
            self.cells[first] = None;
            self.cells[index] = None;
            self.removed_pairs += 1;
            self.message = if self.remaining() == 0 {
                "Board cleared".to_string()
            } else {
                format!("Removed {} and {}", other, value)
            };
        } else {
            self.message = format!("{} and {} do not match", other, value);
        }
    }

    fn render(&self, w: &mut impl Write) -> std::io::Result<()> {
        queue!(
            w,
            Clear(ClearType::All),
            MoveTo(0, 0),
            Print(format!("Sum Link - match equal cells or cells adding to {}", MATCH_SUM)),
        )?;

        for (row, chunk) in self.cells.chunks(self.columns).enumerate() {
            queue!(w, MoveTo(0, 2 + row as u16))?;
            for (col, cell) in chunk.iter().enumerate() {
                let index = row * self.columns + col;
                match cell {
                    Some(value) if self.selected == Some(index) => queue!(
                        w,
                        SetAttribute(Attribute::Reverse),
                        Print(format!("[{}]", value)),
                        SetAttribute(Attribute::Reset),
                        Print(" "),
                    )?,
                    Some(value) => queue!(w, Print(format!("[{}] ", value)))?,
                    None => queue!(w, Print("    "))?,
                }
            }
        }

        let rows = self.cells.len().div_ceil(self.columns) as u16;
        queue!(
            w,
            MoveTo(0, rows + 3),
            Print(format!("Pairs removed: {}  Remaining: {}", self.removed_pairs, self.remaining())),
            MoveTo(0, rows + 4),
            Print(&self.message),
            MoveTo(0, rows + 5),
            Print(format!("> {}", self.input)),
        )?;
        w.flush()
    }
}

/// Restores the terminal on every exit path
struct TerminalGuard;

impl TerminalGuard {
    fn enter() -> std::io::Result<Self> {
        terminal::enable_raw_mode()?;
        execute!(stdout(), EnterAlternateScreen, Hide)?;
        Ok(Self)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = execute!(stdout(), Show, LeaveAlternateScreen);
        let _ = terminal::disable_raw_mode();
    }
}

fn parse_board(spec: &str) -> anyhow::Result<Vec<u8>> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| match s.parse::<u8>() {
            Ok(v) if (1..=9).contains(&v) => Ok(v),
            _ => bail!("invalid cell '{}': cells are digits 1-9", s),
        })
        .collect()
}

fn main() -> anyhow::Result<()> {
    let matches = Command::new("sum_link")
        .about("Terminal number-matching puzzle")
        .arg(
            Arg::new("board")
                .long("board")
                .value_name("VALUES")
                .help("Comma-separated starting cells")
                .default_value(DEFAULT_BOARD),
        )
        .arg(
            Arg::new("columns")
                .long("columns")
                .value_name("N")
                .help("Cells per row")
                .value_parser(clap::value_parser!(usize))
                .default_value("4"),
        )
        .get_matches();

    let board = matches.get_one::<String>("board").map(String::as_str).unwrap_or(DEFAULT_BOARD);
    let columns = matches.get_one::<usize>("columns").copied().unwrap_or(4);
    let mut game = Game::new(parse_board(board)?, columns);

    let _guard = TerminalGuard::enter()?;
    let mut out = stdout();
    game.render(&mut out)?;

    loop {
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => break,
            KeyCode::Char(c) if c.is_ascii_digit() => game.input.push(c),
            KeyCode::Backspace => {
                game.input.pop();
            }
            KeyCode::Enter => game.submit(),
            _ => continue,
        }
        game.render(&mut out)?;
    }

    Ok(())
}
