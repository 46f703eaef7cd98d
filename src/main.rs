// src/main.rs
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::time::{Duration, Instant};
use rand::Rng;
use lazy_static::lazy_static;
use regex::Regex;

// --- Constants ---
const GRID_SIZE: usize = 8;
const INITIAL_TIME_SECONDS: u64 = 15 * 60; // 15 minutes per player
const DEFAULT_RECORD_FILENAME: &str = "chess_game_record.json";

/// Board setup as single-character piece symbols. Uppercase is White,
/// lowercase is Black; the two blank symbols alternate for the renderer but
/// both mean an empty square.
type SetupGrid = [[char; GRID_SIZE]; GRID_SIZE];

// Row index 0 is rank 1 (White's back rank), row index 7 is rank 8.
const DEFAULT_SETUP: SetupGrid = [
    ['R', 'N', 'B', 'Q', 'K', 'B', 'N', 'R'],
    ['P', 'P', 'P', 'P', 'P', 'P', 'P', 'P'],
    [' ', '_', ' ', '_', ' ', '_', ' ', '_'],
    ['_', ' ', '_', ' ', '_', ' ', '_', ' '],
    [' ', '_', ' ', '_', ' ', '_', ' ', '_'],
    ['_', ' ', '_', ' ', '_', ' ', '_', ' '],
    ['p', 'p', 'p', 'p', 'p', 'p', 'p', 'p'],
    ['r', 'n', 'b', 'q', 'k', 'b', 'n', 'r'],
];

// --- Enums and Basic Structs ---

#[derive(Debug, Serialize, Deserialize, Copy, Clone, PartialEq, Eq)]
enum Color { White, Black }

impl Color {
    fn opponent(&self) -> Color {
        match self { Color::White => Color::Black, Color::Black => Color::White }
    }
}

#[derive(Debug, Serialize, Deserialize, Copy, Clone, PartialEq, Eq)]
enum PieceType { King, Queen, Bishop, Rook, Knight, Pawn }

#[derive(Debug, Serialize, Deserialize, Copy, Clone, PartialEq, Eq)]
struct Piece {
    kind: PieceType,
    color: Color,
    /// Bumped every time this piece is the origin of an applied move. Only
    /// exposed as "has this piece moved yet"; no rule reads the exact count.
    move_count: u32,
}

impl Piece {
    fn new(kind: PieceType, color: Color) -> Self {
        Piece { kind, color, move_count: 0 }
    }

    /// Parses a setup symbol. Uppercase is White, lowercase is Black; any
    /// non-piece character means an empty square.
    fn from_symbol(c: char) -> Option<Self> {
        let color = if c.is_ascii_uppercase() { Color::White } else { Color::Black };
        let kind = match c.to_ascii_lowercase() {
            'p' => PieceType::Pawn, 'n' => PieceType::Knight, 'b' => PieceType::Bishop,
            'r' => PieceType::Rook, 'q' => PieceType::Queen, 'k' => PieceType::King,
            _ => return None,
        };
        Some(Piece::new(kind, color))
    }

    #[allow(dead_code)]
    fn has_moved(&self) -> bool {
        self.move_count > 0
    }

    fn symbol(&self) -> char {
        let symbol = match self.kind {
            PieceType::Pawn => 'P', PieceType::Knight => 'N', PieceType::Bishop => 'B',
            PieceType::Rook => 'R', PieceType::Queen => 'Q', PieceType::King => 'K',
        };
        match self.color {
            Color::White => symbol,
            Color::Black => symbol.to_ascii_lowercase(),
        }
    }
}

impl fmt::Display for Piece {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

// --- Coordinates ---

/// A board coordinate in game notation: row and column both run 1..=8, with
/// the column also readable as a letter a..h. Index accessors give the
/// 0-based form used for array lookups.
#[derive(Debug, Serialize, Deserialize, Copy, Clone, PartialEq, Eq)]
struct Coord {
    row: u8,
    col: u8,
}

impl Coord {
    fn new(row: u8, col: u8) -> Self {
        Coord { row, col }
    }

    fn from_letter(row: u8, col: char) -> Self {
        Coord { row, col: (col as u8 - b'a') + 1 }
    }

    fn from_indices(row_index: usize, col_index: usize) -> Self {
        Coord { row: row_index as u8 + 1, col: col_index as u8 + 1 }
    }

    /// Parses a square like "e4". Format only; no legality implied.
    fn from_algebraic(s: &str) -> Option<Self> {
        let mut chars = s.chars();
        let col = chars.next()?;
        let row = chars.next()?;
        if chars.next().is_some() { return None; }
        if !('a'..='h').contains(&col) || !('1'..='8').contains(&row) { return None; }
        Some(Coord::from_letter(row as u8 - b'0', col))
    }

    fn row(&self) -> u8 { self.row }
    fn col(&self) -> u8 { self.col }
    fn row_index(&self) -> usize { self.row as usize - 1 }
    fn col_index(&self) -> usize { self.col as usize - 1 }
    fn col_letter(&self) -> char { (b'a' + self.col - 1) as char }

    /// All squares strictly between two aligned coordinates, walked with a
    /// digital line step from `from` to `to` (both endpoints excluded).
    /// Callers only pass rank, file, or diagonal pairs; anything else is not
    /// a line and the walk result is meaningless.
    fn between(from: Coord, to: Coord) -> Vec<Coord> {
        let mut positions = Vec::new();
        if from == to { return positions; }

        let (x0, y0) = (from.col_index() as i32, from.row_index() as i32);
        let (x1, y1) = (to.col_index() as i32, to.row_index() as i32);

        let dx = (x1 - x0).abs();
        let dy = (y1 - y0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let sy = if y0 < y1 { 1 } else { -1 };

        let mut err = dx - dy;
        let (mut x, mut y) = (x0, y0);

        while !(x == x1 && y == y1) {
            let e2 = 2 * err;
            if e2 > -dy { err -= dy; x += sx; }
            if e2 < dx { err += dx; y += sy; }
            let current = Coord::from_indices(y as usize, x as usize);
            if current != from && current != to {
                positions.push(current);
            }
        }
        positions
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.col_letter(), self.row)
    }
}

/// Chebyshev distance between two squares.
fn chebyshev(a: Coord, b: Coord) -> u8 {
    let dr = a.row().abs_diff(b.row());
    let dc = a.col().abs_diff(b.col());
    dr.max(dc)
}

// --- Directions ---

/// Compass direction between two squares, with N pointing toward higher
/// rows (rank 1 to rank 8). Knight stands in for every L-shaped offset.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Direction { N, NE, E, SE, S, SW, W, NW, Knight }

impl Direction {
    fn reverse(self) -> Direction {
        match self {
            Direction::N => Direction::S,
            Direction::S => Direction::N,
            Direction::E => Direction::W,
            Direction::W => Direction::E,
            Direction::NE => Direction::SW,
            Direction::SW => Direction::NE,
            Direction::NW => Direction::SE,
            Direction::SE => Direction::NW,
            Direction::Knight => Direction::Knight,
        }
    }

    /// Direction for a single-step or L-shaped offset, where `dr`/`dc` are
    /// row and column deltas toward the other square. Anything else is not a
    /// neighbor offset.
    fn from_offset(dr: i8, dc: i8) -> Option<Direction> {
        match (dr, dc) {
            (1, 0) => Some(Direction::N),
            (1, 1) => Some(Direction::NE),
            (0, 1) => Some(Direction::E),
            (-1, 1) => Some(Direction::SE),
            (-1, 0) => Some(Direction::S),
            (-1, -1) => Some(Direction::SW),
            (0, -1) => Some(Direction::W),
            (1, -1) => Some(Direction::NW),
            _ if (dr.abs() == 2 && dc.abs() == 1) || (dr.abs() == 1 && dc.abs() == 2) => {
                Some(Direction::Knight)
            }
            _ => None,
        }
    }

    /// Normalized direction of travel from `from` to `to`: a compass value
    /// for aligned squares at any distance, Knight for an L-shape, None for
    /// everything else.
    fn of_line(from: Coord, to: Coord) -> Option<Direction> {
        let dr = to.row as i8 - from.row as i8;
        let dc = to.col as i8 - from.col as i8;
        if dr == 0 && dc == 0 { return None; }
        if dr == 0 || dc == 0 || dr.abs() == dc.abs() {
            return Direction::from_offset(dr.signum(), dc.signum());
        }
        Direction::from_offset(dr, dc).filter(|d| *d == Direction::Knight)
    }

    /// Unit row/column offset for the eight compass values.
    fn offset(self) -> Option<(i8, i8)> {
        match self {
            Direction::N => Some((1, 0)),
            Direction::NE => Some((1, 1)),
            Direction::E => Some((0, 1)),
            Direction::SE => Some((-1, 1)),
            Direction::S => Some((-1, 0)),
            Direction::SW => Some((-1, -1)),
            Direction::W => Some((0, -1)),
            Direction::NW => Some((1, -1)),
            Direction::Knight => None,
        }
    }
}

// --- Attack Tables ---

const KING_ATTACK_DIRS: &[Direction] = &[
    Direction::N, Direction::NE, Direction::E, Direction::SE,
    Direction::S, Direction::SW, Direction::W, Direction::NW,
];
const QUEEN_ATTACK_DIRS: &[Direction] = KING_ATTACK_DIRS;
const ROOK_ATTACK_DIRS: &[Direction] = &[Direction::N, Direction::E, Direction::S, Direction::W];
const BISHOP_ATTACK_DIRS: &[Direction] = &[Direction::NE, Direction::SE, Direction::SW, Direction::NW];
const KNIGHT_ATTACK_DIRS: &[Direction] = &[Direction::Knight];
const WHITE_PAWN_ATTACK_DIRS: &[Direction] = &[Direction::NE, Direction::NW];
const BLACK_PAWN_ATTACK_DIRS: &[Direction] = &[Direction::SE, Direction::SW];

/// Whether a piece of the given kind and color attacks along `dir`. Pawns
/// attack only their two forward diagonals; their straight push is movement,
/// not an attack, and is handled separately.
fn can_attack(kind: PieceType, color: Color, dir: Direction) -> bool {
    let dirs = match kind {
        PieceType::King => KING_ATTACK_DIRS,
        PieceType::Queen => QUEEN_ATTACK_DIRS,
        PieceType::Rook => ROOK_ATTACK_DIRS,
        PieceType::Bishop => BISHOP_ATTACK_DIRS,
        PieceType::Knight => KNIGHT_ATTACK_DIRS,
        PieceType::Pawn => match color {
            Color::White => WHITE_PAWN_ATTACK_DIRS,
            Color::Black => BLACK_PAWN_ATTACK_DIRS,
        },
    };
    dirs.contains(&dir)
}

/// The straight direction a pawn moves without capturing.
fn pawn_push_dir(color: Color) -> Direction {
    match color { Color::White => Direction::N, Color::Black => Direction::S }
}

/// 0-based row index a pawn of this color starts on.
fn pawn_start_row_index(color: Color) -> usize {
    match color { Color::White => 1, Color::Black => 6 }
}

// --- Move Representation ---

/// An entry in a square's move list: the occupant of `from` may travel to
/// `to`. `captured` records the occupant type found at the destination when
/// the entry was generated (None for a move onto an empty square). The same
/// field doubles as the bookkeeping slot for defended squares, so "capture"
/// and "occupant at destination" are deliberately one notion here.
#[derive(Debug, Serialize, Deserialize, Copy, Clone, PartialEq, Eq)]
struct Move {
    from: Coord,
    to: Coord,
    captured: Option<PieceType>,
}

impl Move {
    fn new(from: Coord, to: Coord, captured: Option<PieceType>) -> Self {
        Move { from, to, captured }
    }

    fn is_capture(&self) -> bool {
        self.captured.is_some()
    }

    /// Coordinate-pair notation, e.g. "e2e4".
    fn notation(&self) -> String {
        format!("{}{}", self.from, self.to)
    }
}

// --- Signals ---

/// The ten message kinds squares exchange. The three Relay kinds are the
/// ray continuations of the corresponding fresh announcements.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SignalKind {
    EmptyCell,
    RelayEmptyCell,
    NewPiece,
    RelayNewPiece,
    Update,
    RelayUpdate,
    Reply,
    ProtectionCheck,
    ProtectionConfirm,
    ReplyProtected,
}

/// A message between squares. `color`/`piece` describe the originating
/// occupant (both None when an empty square speaks for itself), `origin` is
/// that square's coordinate, and `direction` points from the receiving
/// square back toward the origin. A signal travels along a ray by being
/// re-emitted from each hop; only the receiver whose own bearing to the
/// sender matches `direction` carries it further.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Signal {
    kind: SignalKind,
    color: Option<Color>,
    piece: Option<PieceType>,
    origin: Coord,
    direction: Direction,
}

// --- Adjacency ---

lazy_static! {
    /// Fixed subscription graph: for every cell, the 8 compass-adjacent and
    /// up to 8 knight-offset cells, clipped at the board edge. Symmetric by
    /// construction.
    static ref NEIGHBORS: Vec<Vec<Vec<(usize, usize)>>> = compute_neighbors();
}

fn compute_neighbors() -> Vec<Vec<Vec<(usize, usize)>>> {
    const KNIGHT_OFFSETS: [(i32, i32); 8] = [
        (2, 1), (1, 2), (-1, 2), (-2, 1),
        (-2, -1), (-1, -2), (1, -2), (2, -1),
    ];

    let mut table = vec![vec![Vec::new(); GRID_SIZE]; GRID_SIZE];
    for row in 0..GRID_SIZE {
        for col in 0..GRID_SIZE {
            let links = &mut table[row][col];
            for dr in -1i32..=1 {
                for dc in -1i32..=1 {
                    if dr == 0 && dc == 0 { continue; }
                    let (nr, nc) = (row as i32 + dr, col as i32 + dc);
                    if (0..GRID_SIZE as i32).contains(&nr) && (0..GRID_SIZE as i32).contains(&nc) {
                        links.push((nr as usize, nc as usize));
                    }
                }
            }
            for (dr, dc) in KNIGHT_OFFSETS {
                let (nr, nc) = (row as i32 + dr, col as i32 + dc);
                if (0..GRID_SIZE as i32).contains(&nr) && (0..GRID_SIZE as i32).contains(&nc) {
                    links.push((nr as usize, nc as usize));
                }
            }
        }
    }
    table
}

// --- Square ---

/// What an observer sees of a square: its coordinate and the identity of
/// whatever currently occupies it.
#[derive(Debug, Copy, Clone)]
struct SquareView {
    coord: Coord,
    color: Option<Color>,
    kind: Option<PieceType>,
}

/// Anything that wants square-occupancy notifications. Receivers get a fresh
/// view on every signal a square emits, including relay chatter; redrawing
/// from occupant identity alone makes the redundancy harmless.
trait SquareObserver {
    fn receive(&mut self, view: SquareView);
}

/// One cell of the grid. Holds its occupant, the list of moves currently
/// available to that occupant, a flag for "a friendly piece defends this
/// square's occupant", and the last signal it put on the wire.
#[derive(Debug, Clone)]
struct Square {
    coord: Coord,
    occupant: Option<Piece>,
    moves: Vec<Move>,
    protected: bool,
    last_signal: Option<Signal>,
}

impl Square {
    fn new(coord: Coord) -> Self {
        Square { coord, occupant: None, moves: Vec::new(), protected: false, last_signal: None }
    }

    fn view(&self) -> SquareView {
        SquareView {
            coord: self.coord,
            color: self.occupant.map(|p| p.color),
            kind: self.occupant.map(|p| p.kind),
        }
    }

    /// Clears the computed state. Both the move list and the protected flag
    /// are always rebuilt from scratch by the replies that follow a
    /// re-announcement, never patched incrementally.
    fn reset(&mut self) {
        self.moves.clear();
        self.protected = false;
    }

    /// The announcement this square would make for its current occupancy.
    /// The direction field of a fresh announcement is a placeholder.
    fn announcement(&self, kind: SignalKind) -> Signal {
        Signal {
            kind,
            color: self.occupant.map(|p| p.color),
            piece: self.occupant.map(|p| p.kind),
            origin: self.coord,
            direction: Direction::N,
        }
    }

    /// Handles one incoming signal. `dir` is this square's bearing back
    /// toward the sender (a compass point, or Knight for an L offset).
    /// Mutates only this square's own move list and protected flag, and
    /// returns the signals this square emits in response, in order.
    fn respond(&mut self, incoming: &Signal, dir: Direction) -> Vec<Signal> {
        match self.occupant {
            None => self.respond_empty(incoming, dir),
            Some(piece) => self.respond_occupied(piece, incoming, dir),
        }
    }

    // An empty square is a pure conduit: it answers announcements with a
    // Reply naming itself (so the announcer learns it may move here) and
    // pushes ray traffic one step further. Knight-offset traffic never
    // travels through empties beyond the first hop.
    fn respond_empty(&mut self, incoming: &Signal, dir: Direction) -> Vec<Signal> {
        let mut out = Vec::new();
        self.reset();
        match incoming.kind {
            SignalKind::EmptyCell => {
                if dir != Direction::Knight {
                    out.push(self.relay(incoming, dir));
                }
            }
            SignalKind::NewPiece | SignalKind::Update => {
                if dir != Direction::Knight || incoming.piece == Some(PieceType::Knight) {
                    out.push(self.reply_as_empty(dir));
                }
                if dir != Direction::Knight {
                    out.push(self.relay(incoming, dir));
                }
            }
            SignalKind::RelayEmptyCell => {
                if dir != Direction::Knight && dir == incoming.direction {
                    out.push(self.relay(incoming, dir));
                }
            }
            SignalKind::RelayNewPiece | SignalKind::RelayUpdate => {
                if dir != Direction::Knight && dir == incoming.direction {
                    out.push(self.reply_as_empty(dir));
                    out.push(self.relay(incoming, dir));
                }
            }
            SignalKind::Reply
            | SignalKind::ReplyProtected
            | SignalKind::ProtectionCheck
            | SignalKind::ProtectionConfirm => {
                if dir != Direction::Knight && dir == incoming.direction {
                    out.push(self.relay(incoming, dir));
                }
            }
        }
        out
    }

    fn respond_occupied(&mut self, piece: Piece, incoming: &Signal, dir: Direction) -> Vec<Signal> {
        let mut out = Vec::new();
        match incoming.kind {
            // A neighboring square emptied: occupancy in sight may have
            // changed, so re-announce and rebuild. A knight only cares
            // about its L-offset squares, every other piece only about its
            // rays.
            SignalKind::EmptyCell => {
                let relevant = if piece.kind == PieceType::Knight {
                    dir == Direction::Knight
                } else {
                    dir != Direction::Knight
                };
                if relevant {
                    out.push(self.announcement(SignalKind::Update));
                    self.reset();
                }
            }
            SignalKind::RelayEmptyCell => {
                if piece.kind != PieceType::Knight
                    && dir != Direction::Knight
                    && dir == incoming.direction
                {
                    out.push(self.announcement(SignalKind::Update));
                    self.reset();
                }
            }
            // A piece arrived in sight: answer it, then re-announce so the
            // newcomer (and everything behind it) sees this piece, then
            // probe whether the newcomer pins this piece to its king.
            SignalKind::NewPiece => {
                if dir != Direction::Knight || incoming.piece == Some(PieceType::Knight) {
                    out.push(self.reply_signal(piece, incoming, dir));
                }
                out.push(self.announcement(SignalKind::Update));
                self.reset();
                if let Some(probe) = self.pin_probe(piece, incoming, dir) {
                    out.push(probe);
                }
            }
            SignalKind::RelayNewPiece => {
                if dir == incoming.direction {
                    out.push(self.reply_signal(piece, incoming, dir));
                    out.push(self.announcement(SignalKind::Update));
                    self.reset();
                    if let Some(probe) = self.pin_probe(piece, incoming, dir) {
                        out.push(probe);
                    }
                }
            }
            // A re-announcement: answer it so the announcer can rebuild its
            // list, but this square's own state is unaffected.
            SignalKind::Update => {
                if dir != Direction::Knight || incoming.piece == Some(PieceType::Knight) {
                    out.push(self.reply_signal(piece, incoming, dir));
                }
                if let Some(probe) = self.pin_probe(piece, incoming, dir) {
                    out.push(probe);
                }
            }
            SignalKind::RelayUpdate => {
                if dir == incoming.direction {
                    out.push(self.reply_signal(piece, incoming, dir));
                    if let Some(probe) = self.pin_probe(piece, incoming, dir) {
                        out.push(probe);
                    }
                }
            }
            SignalKind::Reply => {
                self.record_reply(piece, incoming, dir);
            }
            SignalKind::ReplyProtected => {
                self.record_protection(piece, incoming, dir);
            }
            // Only a king answers a pin probe, and only for its own side.
            SignalKind::ProtectionCheck => {
                if piece.kind == PieceType::King
                    && dir != Direction::Knight
                    && dir == incoming.direction
                    && incoming.color == Some(piece.color)
                {
                    out.push(Signal {
                        kind: SignalKind::ProtectionConfirm,
                        color: Some(piece.color),
                        piece: Some(PieceType::King),
                        origin: self.coord,
                        direction: dir.reverse(),
                    });
                }
            }
            // The king confirmed the pin: this piece's mobility collapses
            // to the pin line.
            SignalKind::ProtectionConfirm => {
                if piece.kind != PieceType::King
                    && dir != Direction::Knight
                    && dir == incoming.direction
                {
                    self.restrict_to_axis(dir);
                }
            }
        }
        out
    }

    /// Forwards a ray signal one step, preserving the original payload. The
    /// carried direction is this square's bearing to the sender, which for
    /// collinear traffic is also its bearing to the origin.
    fn relay(&self, incoming: &Signal, dir: Direction) -> Signal {
        let kind = match incoming.kind {
            SignalKind::EmptyCell | SignalKind::RelayEmptyCell => SignalKind::RelayEmptyCell,
            SignalKind::NewPiece | SignalKind::RelayNewPiece => SignalKind::RelayNewPiece,
            SignalKind::Update | SignalKind::RelayUpdate => SignalKind::RelayUpdate,
            other => other,
        };
        Signal { kind, direction: dir, ..*incoming }
    }

    /// An empty square answering an announcement: "you may come here".
    fn reply_as_empty(&self, dir: Direction) -> Signal {
        Signal {
            kind: SignalKind::Reply,
            color: None,
            piece: None,
            origin: self.coord,
            direction: dir.reverse(),
        }
    }

    /// An occupied square answering an announcement with its own identity:
    /// Reply toward an enemy (a target), ReplyProtected toward a friend
    /// (cover). The announcer decides what the answer is worth.
    fn reply_signal(&self, piece: Piece, incoming: &Signal, dir: Direction) -> Signal {
        let kind = if incoming.color == Some(piece.color) {
            SignalKind::ReplyProtected
        } else {
            SignalKind::Reply
        };
        Signal {
            kind,
            color: Some(piece.color),
            piece: Some(piece.kind),
            origin: self.coord,
            direction: dir.reverse(),
        }
    }

    /// A hostile slider appeared along `dir`: ask whether a same-colored
    /// king sits on the opposite ray. Kings never probe, and announcements
    /// from kings, pawns, and knights cannot pin.
    fn pin_probe(&self, piece: Piece, incoming: &Signal, dir: Direction) -> Option<Signal> {
        if piece.kind == PieceType::King {
            return None;
        }
        let attacker = incoming.piece?;
        let attacker_color = incoming.color?;
        if attacker_color == piece.color {
            return None;
        }
        if matches!(attacker, PieceType::King | PieceType::Pawn | PieceType::Knight) {
            return None;
        }
        if !can_attack(attacker, attacker_color, dir.reverse()) {
            return None;
        }
        Some(Signal {
            kind: SignalKind::ProtectionCheck,
            color: Some(piece.color),
            piece: Some(piece.kind),
            origin: self.coord,
            direction: dir,
        })
    }

    /// A Reply arrived: record a move onto the replying square if this
    /// occupant can actually travel there.
    fn record_reply(&mut self, piece: Piece, incoming: &Signal, dir: Direction) {
        if dir != incoming.direction || incoming.color == Some(piece.color) {
            return;
        }
        let reachable = match piece.kind {
            // A king steps one square only; ray replies from further away
            // do not concern it.
            PieceType::King => {
                can_attack(PieceType::King, piece.color, dir)
                    && chebyshev(self.coord, incoming.origin) <= 1
            }
            PieceType::Pawn => self.pawn_can_reach(piece.color, incoming, dir),
            kind => can_attack(kind, piece.color, dir),
        };
        if reachable {
            self.moves.push(Move::new(self.coord, incoming.origin, incoming.piece));
        }
    }

    /// Pawn movement: capture one step along a forward diagonal onto a
    /// hostile occupant, or advance straight onto an empty square, one step
    /// anywhere or two steps from the start row. The two-step entry can only
    /// arrive through a relay, which guarantees the crossed square is empty.
    fn pawn_can_reach(&self, color: Color, incoming: &Signal, dir: Direction) -> bool {
        let row_dist = self.coord.row.abs_diff(incoming.origin.row);
        let col_dist = self.coord.col.abs_diff(incoming.origin.col);
        if incoming.piece.is_some() {
            can_attack(PieceType::Pawn, color, dir) && row_dist <= 1 && col_dist <= 1
        } else if dir == pawn_push_dir(color) {
            row_dist == 1
                || (row_dist == 2
                    && col_dist == 0
                    && self.coord.row_index() == pawn_start_row_index(color))
        } else {
            false
        }
    }

    /// A ReplyProtected arrived: a same-colored piece claims to cover this
    /// square. The claim counts only if that piece really attacks along the
    /// reverse bearing, with kings and pawns covering adjacent squares only.
    /// The flag is one-way within a wave; only a reset clears it.
    fn record_protection(&mut self, piece: Piece, incoming: &Signal, dir: Direction) {
        if self.protected {
            return;
        }
        if dir != incoming.direction || incoming.color != Some(piece.color) {
            return;
        }
        let (Some(defender), Some(defender_color)) = (incoming.piece, incoming.color) else {
            return;
        };
        let mut covers = if dir == Direction::Knight {
            defender == PieceType::Knight
        } else {
            can_attack(defender, defender_color, dir.reverse())
        };
        if covers && matches!(defender, PieceType::King | PieceType::Pawn) {
            covers = chebyshev(self.coord, incoming.origin) <= 1;
        }
        if covers {
            self.protected = true;
        }
    }

    /// Keeps only the moves that travel along the pin axis or its reverse.
    fn restrict_to_axis(&mut self, axis: Direction) {
        let reverse = axis.reverse();
        self.moves.retain(|mv| {
            matches!(Direction::of_line(mv.from, mv.to), Some(d) if d == axis || d == reverse)
        });
    }
}

// --- Text Display ---

/// Character rendering of the board. Subscribes to every square and redraws
/// a cell from each view it receives.
#[derive(Debug, Clone)]
struct TextDisplay {
    cells: [[char; GRID_SIZE]; GRID_SIZE],
}

impl TextDisplay {
    fn new() -> Self {
        let mut cells = [[' '; GRID_SIZE]; GRID_SIZE];
        for (r, row) in cells.iter_mut().enumerate() {
            for (c, cell) in row.iter_mut().enumerate() {
                *cell = blank_symbol(r, c);
            }
        }
        TextDisplay { cells }
    }
}

/// The checkerboard pattern used for empty squares.
fn blank_symbol(row_index: usize, col_index: usize) -> char {
    if (row_index + col_index) % 2 == 0 { ' ' } else { '_' }
}

impl SquareObserver for TextDisplay {
    fn receive(&mut self, view: SquareView) {
        let symbol = match (view.kind, view.color) {
            (Some(kind), Some(color)) => Piece::new(kind, color).symbol(),
            _ => blank_symbol(view.coord.row_index(), view.coord.col_index()),
        };
        self.cells[view.coord.row_index()][view.coord.col_index()] = symbol;
    }
}

impl fmt::Display for TextDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in (0..GRID_SIZE).rev() {
            write!(f, "{} ", row + 1)?;
            for col in 0..GRID_SIZE {
                write!(f, "{} ", self.cells[row][col])?;
            }
            writeln!(f)?;
        }
        writeln!(f, "\n  a b c d e f g h")
    }
}

// --- Board ---

/// Outcome of resolving the side to move's check situation: not in check at
/// all, or the full set of replies that address the check (empty means
/// checkmate).
#[derive(Debug, Clone, PartialEq, Eq)]
enum CheckResolution {
    NotInCheck,
    Responses(Vec<Move>),
}

/// The 8x8 grid plus everything derived from it: tracked king positions,
/// the side to move, the played-move history, and one aggregated move list
/// per color. The aggregated lists are rebuilt by a full rescan after every
/// mutation rather than patched.
#[derive(Debug, Clone)]
struct Board {
    grid: Vec<Vec<Square>>,
    white_king: Option<Coord>,
    black_king: Option<Coord>,
    turn: Color,
    history: Vec<Move>,
    white_moves: Vec<Move>,
    black_moves: Vec<Move>,
    display: TextDisplay,
}

impl Board {
    fn new() -> Self {
        let grid = (0..GRID_SIZE)
            .map(|r| (0..GRID_SIZE).map(|c| Square::new(Coord::from_indices(r, c))).collect())
            .collect();
        Board {
            grid,
            white_king: None,
            black_king: None,
            turn: Color::White,
            history: Vec::new(),
            white_moves: Vec::new(),
            black_moves: Vec::new(),
            display: TextDisplay::new(),
        }
    }

    /// Places the pieces described by `setup`, rebuilds the subscription
    /// state from scratch, seeds every square's move list with one
    /// announcement per square, and fills both aggregated lists. Reusable:
    /// any previous grid contents are discarded wholesale, so no stale
    /// square can be left pointing at the old arrangement.
    fn init(&mut self, setup: &SetupGrid) {
        self.grid = (0..GRID_SIZE)
            .map(|r| (0..GRID_SIZE).map(|c| Square::new(Coord::from_indices(r, c))).collect())
            .collect();
        self.display = TextDisplay::new();
        self.white_king = None;
        self.black_king = None;
        self.history.clear();

        for (r, row) in setup.iter().enumerate() {
            for (c, &symbol) in row.iter().enumerate() {
                let piece = Piece::from_symbol(symbol);
                if let Some(p) = piece {
                    if p.kind == PieceType::King {
                        match p.color {
                            Color::White => self.white_king = Some(Coord::from_indices(r, c)),
                            Color::Black => self.black_king = Some(Coord::from_indices(r, c)),
                        }
                    }
                }
                self.grid[r][c].occupant = piece;
            }
        }

        // One propagation wave per square, in row-major order, to seed the
        // move lists. Occupied squares announce themselves, empty squares
        // announce their emptiness. Each square starts its own wave from a
        // clean slate; earlier waves may already have filled it in.
        for r in 0..GRID_SIZE {
            for c in 0..GRID_SIZE {
                let kind = if self.grid[r][c].occupant.is_some() {
                    SignalKind::Update
                } else {
                    SignalKind::EmptyCell
                };
                self.grid[r][c].reset();
                let signal = self.grid[r][c].announcement(kind);
                self.emit((r, c), signal);
            }
        }

        self.rebuild_move_lists();
    }

    fn square(&self, at: Coord) -> &Square {
        &self.grid[at.row_index()][at.col_index()]
    }

    fn occupant(&self, at: Coord) -> Option<Piece> {
        self.square(at).occupant
    }

    fn turn(&self) -> Color {
        self.turn
    }

    fn set_turn(&mut self, color: Color) {
        self.turn = color;
    }

    fn king(&self, color: Color) -> Option<Coord> {
        match color { Color::White => self.white_king, Color::Black => self.black_king }
    }

    fn moves_for(&self, color: Color) -> &[Move] {
        match color { Color::White => &self.white_moves, Color::Black => &self.black_moves }
    }

    /// The aggregated list for the side to move.
    fn current_moves(&self) -> &[Move] {
        self.moves_for(self.turn)
    }

    /// Whether `mv` is in the side to move's aggregated list. Equality is
    /// component-wise, so the caller must have filled in the destination
    /// occupant the same way the list entries did.
    fn is_legal_move(&self, mv: &Move) -> bool {
        self.current_moves().contains(mv)
    }

    /// Stores `signal` in the square's outgoing slot and broadcasts it.
    fn emit(&mut self, at: (usize, usize), signal: Signal) {
        self.grid[at.0][at.1].last_signal = Some(signal);
        self.notify_from(at);
    }

    /// Broadcasts the signal currently held by the square at `at`: shows the
    /// square to the display, then walks the fixed neighbor table
    /// depth-first, letting each receiver respond and immediately carrying
    /// any response waves to completion. Ray relays die out within the board
    /// diameter and replies never re-announce, so every wave settles.
    fn notify_from(&mut self, at: (usize, usize)) {
        let Some(signal) = self.grid[at.0][at.1].last_signal else { return; };
        let view = self.grid[at.0][at.1].view();
        self.display.receive(view);

        for &(nr, nc) in NEIGHBORS[at.0][at.1].iter() {
            let dr = at.0 as i8 - nr as i8;
            let dc = at.1 as i8 - nc as i8;
            let dir = match Direction::from_offset(dr, dc) {
                Some(d) => d,
                None => unreachable!("subscription table links non-neighbor squares"),
            };
            let emitted = self.grid[nr][nc].respond(&signal, dir);
            for response in emitted {
                self.emit((nr, nc), response);
            }
        }
    }

    /// Re-broadcasts a square's current occupancy without changing it. A
    /// settled grid absorbs this without any square's computed state
    /// shifting.
    #[allow(dead_code)]
    fn rebroadcast(&mut self, at: Coord) {
        let idx = (at.row_index(), at.col_index());
        let kind = if self.grid[idx.0][idx.1].occupant.is_some() {
            SignalKind::Update
        } else {
            SignalKind::EmptyCell
        };
        self.grid[idx.0][idx.1].reset();
        let signal = self.grid[idx.0][idx.1].announcement(kind);
        self.emit(idx, signal);
        self.rebuild_move_lists();
    }

    /// Applies a move unconditionally: the origin empties, the destination
    /// takes the piece, both squares broadcast, the turn flips, and the
    /// aggregated lists are rebuilt from the settled grid. Legality is the
    /// caller's business; validate against the aggregated list first.
    fn apply_move(&mut self, mv: &Move) {
        self.history.push(*mv);

        if Some(mv.from) == self.white_king {
            self.white_king = Some(mv.to);
        } else if Some(mv.from) == self.black_king {
            self.black_king = Some(mv.to);
        }

        let from_idx = (mv.from.row_index(), mv.from.col_index());
        let to_idx = (mv.to.row_index(), mv.to.col_index());

        let mut piece = self.grid[from_idx.0][from_idx.1]
            .occupant
            .take()
            .unwrap_or_else(|| panic!("move applied from empty square {}", mv.from));
        piece.move_count += 1;

        self.grid[from_idx.0][from_idx.1].reset();
        self.grid[to_idx.0][to_idx.1].occupant = Some(piece);
        self.grid[to_idx.0][to_idx.1].reset();

        let departure = self.grid[from_idx.0][from_idx.1].announcement(SignalKind::EmptyCell);
        self.emit(from_idx, departure);
        let arrival = self.grid[to_idx.0][to_idx.1].announcement(SignalKind::NewPiece);
        self.emit(to_idx, arrival);

        self.turn = self.turn.opponent();
        self.rebuild_move_lists();
    }

    /// History bookkeeping only: drops and returns the most recent entry.
    /// The grid is not reverted.
    #[allow(dead_code)]
    fn pop_move(&mut self) -> Option<Move> {
        self.history.pop()
    }

    fn history(&self) -> &[Move] {
        &self.history
    }

    /// Rebuilds both aggregated lists by scanning every square of the color
    /// and concatenating its move list. Always a full recompute; the fixed
    /// board size makes staleness a worse enemy than the rescan cost.
    fn rebuild_move_lists(&mut self) {
        self.white_moves = self.collect_moves(Color::White);
        self.black_moves = self.collect_moves(Color::Black);
    }

    fn collect_moves(&self, color: Color) -> Vec<Move> {
        let mut all = Vec::new();
        for row in &self.grid {
            for square in row {
                match square.occupant {
                    Some(p) if p.color == color => {
                        if p.kind == PieceType::King {
                            all.extend(self.king_steps(color));
                        } else {
                            all.extend(square.moves.iter().copied());
                        }
                    }
                    _ => {}
                }
            }
        }
        all
    }

    /// The king's one-step list with suicidal steps removed: no stepping
    /// onto a square the opponent covers, and no capturing an occupant that
    /// a friendly piece stands ready to retake.
    fn king_steps(&self, color: Color) -> Vec<Move> {
        let Some(at) = self.king(color) else { return Vec::new(); };
        let danger = self.covered_map(color.opponent());
        self.square(at)
            .moves
            .iter()
            .filter(|mv| {
                if danger[mv.to.row_index()][mv.to.col_index()] {
                    return false;
                }
                !(mv.is_capture() && self.square(mv.to).protected)
            })
            .copied()
            .collect()
    }

    /// Every square a color bears on, read off the settled per-square move
    /// lists: move destinations (a pawn's straight push moves without
    /// attacking, so those are skipped), both forward diagonals of every
    /// pawn whether or not a target stands there, and the square directly
    /// behind a checked king on each active check ray, which stays covered
    /// once the king steps away.
    fn covered_map(&self, by: Color) -> [[bool; GRID_SIZE]; GRID_SIZE] {
        let mut map = [[false; GRID_SIZE]; GRID_SIZE];

        for row in &self.grid {
            for square in row {
                let Some(p) = square.occupant else { continue; };
                if p.color != by {
                    continue;
                }
                for mv in &square.moves {
                    if p.kind == PieceType::Pawn && mv.from.col() == mv.to.col() {
                        continue;
                    }
                    map[mv.to.row_index()][mv.to.col_index()] = true;
                }
                if p.kind == PieceType::Pawn {
                    for dir in match by {
                        Color::White => WHITE_PAWN_ATTACK_DIRS,
                        Color::Black => BLACK_PAWN_ATTACK_DIRS,
                    } {
                        if let Some(target) = step(square.coord, *dir) {
                            map[target.row_index()][target.col_index()] = true;
                        }
                    }
                }
            }
        }

        // Read the check rays off the square lists directly; the aggregated
        // list may be mid-rebuild when this runs.
        for row in &self.grid {
            for square in row {
                if !matches!(square.occupant, Some(p) if p.color == by) {
                    continue;
                }
                for mv in &square.moves {
                    if mv.captured != Some(PieceType::King) {
                        continue;
                    }
                    if let Some(dir) = Direction::of_line(mv.from, mv.to) {
                        if dir != Direction::Knight {
                            if let Some(beyond) = step(mv.to, dir) {
                                map[beyond.row_index()][beyond.col_index()] = true;
                            }
                        }
                    }
                }
            }
        }

        map
    }

    /// Check test: the side not to move already holds a move that lands on
    /// the king.
    fn is_check(&self) -> bool {
        self.moves_for(self.turn.opponent())
            .iter()
            .any(|mv| mv.captured == Some(PieceType::King))
    }

    /// Resolves the side to move's check situation without touching any
    /// state. Responses are the union of: captures of the checker,
    /// interpositions on the checker's line (for a single sliding checker),
    /// and the king's own filtered steps. Two or more checkers leave only
    /// the king's steps; a knight checker cannot be blocked.
    fn resolve_check(&self) -> CheckResolution {
        let defender = self.turn;
        let mut checking: Vec<Move> = self
            .moves_for(defender.opponent())
            .iter()
            .filter(|mv| mv.captured == Some(PieceType::King))
            .copied()
            .collect();
        // The lists are multisets; a twice-reported checker is one checker.
        checking.dedup();

        if checking.is_empty() {
            return CheckResolution::NotInCheck;
        }

        let king_steps = self.king_steps(defender);

        if checking.len() > 1 {
            return CheckResolution::Responses(king_steps);
        }

        let check = checking[0];
        let checker_is_knight =
            self.occupant(check.from).map(|p| p.kind) == Some(PieceType::Knight);
        let king_at = self.king(defender);

        let mut responses: Vec<Move> = Vec::new();
        for mv in self.moves_for(defender) {
            if Some(mv.from) == king_at {
                continue; // king replies come from the filtered list below
            }
            if mv.to == check.from {
                responses.push(*mv);
            } else if !checker_is_knight
                && Coord::between(check.from, check.to).contains(&mv.to)
            {
                responses.push(*mv);
            }
        }
        responses.extend(king_steps);

        CheckResolution::Responses(responses)
    }

    /// Checkmate test. When the side to move is in check, its aggregated
    /// list is narrowed in place to exactly the check-addressing replies, so
    /// "current legal moves" afterwards means "moves that resolve the
    /// check". Returns true when no reply exists.
    fn is_checkmate(&mut self) -> bool {
        match self.resolve_check() {
            CheckResolution::NotInCheck => false,
            CheckResolution::Responses(responses) => {
                let mate = responses.is_empty();
                match self.turn {
                    Color::White => self.white_moves = responses,
                    Color::Black => self.black_moves = responses,
                }
                mate
            }
        }
    }

    /// Stalemate test: the side to move has nothing to play. Callers must
    /// rule out check first; an empty list while in check is checkmate, not
    /// stalemate.
    fn is_stalemate(&self) -> bool {
        self.current_moves().is_empty()
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display)
    }
}

/// One compass step from a square, None when it would leave the board.
fn step(from: Coord, dir: Direction) -> Option<Coord> {
    let (dr, dc) = dir.offset()?;
    let row = from.row as i8 + dr;
    let col = from.col as i8 + dc;
    if (1..=GRID_SIZE as i8).contains(&row) && (1..=GRID_SIZE as i8).contains(&col) {
        Some(Coord::new(row as u8, col as u8))
    } else {
        None
    }
}

// --- Players ---

/// A participant that produces moves for one side. Humans type their moves,
/// so picking returns nothing for them; the session loop supplies the typed
/// squares instead.
trait Player {
    fn color(&self) -> Color;
    fn pick_move(&mut self, board: &Board) -> Option<Move>;
    fn is_human(&self) -> bool { false }
}

struct HumanPlayer {
    color: Color,
}

impl HumanPlayer {
    fn new(color: Color) -> Self {
        HumanPlayer { color }
    }
}

impl Player for HumanPlayer {
    fn color(&self) -> Color { self.color }
    fn pick_move(&mut self, _board: &Board) -> Option<Move> { None }
    fn is_human(&self) -> bool { true }
}

/// Automated opponent. Level 1 plays uniformly at random. Level 2 prefers a
/// capture, then a checking move, then anything. Level 3 first narrows to
/// moves whose destination the opponent does not bear on, then applies the
/// level 2 preferences inside that pool.
struct ComputerPlayer {
    color: Color,
    level: u8,
    rng: rand::rngs::ThreadRng,
}

impl ComputerPlayer {
    fn new(color: Color, level: u8) -> Self {
        ComputerPlayer { color, level, rng: rand::rng() }
    }

    fn tactical_pick(&self, board: &Board, pool: &[Move]) -> Option<Move> {
        if let Some(mv) = pool.iter().find(|mv| mv.is_capture()) {
            return Some(*mv);
        }
        pool.iter().find(|mv| gives_check(board, mv)).copied()
    }
}

impl Player for ComputerPlayer {
    fn color(&self) -> Color { self.color }

    fn pick_move(&mut self, board: &Board) -> Option<Move> {
        let moves = board.moves_for(self.color).to_vec();
        if moves.is_empty() {
            return None;
        }
        let pick = match self.level {
            1 => moves[self.rng.random_range(0..moves.len())],
            2 => self.tactical_pick(board, &moves).unwrap_or(moves[0]),
            _ => {
                let danger = board.covered_map(self.color.opponent());
                let safe: Vec<Move> = moves
                    .iter()
                    .filter(|mv| {
                        !danger[mv.to.row_index()][mv.to.col_index()]
                            && !(mv.is_capture() && board.square(mv.to).protected)
                    })
                    .copied()
                    .collect();
                let pool = if safe.is_empty() { &moves } else { &safe };
                self.tactical_pick(board, pool).unwrap_or(pool[0])
            }
        };
        Some(pick)
    }
}

/// Whether playing `mv` would leave the enemy king attacked by the moved
/// piece. Blockers are read off the current grid, which is what the move
/// lists themselves are built from.
fn gives_check(board: &Board, mv: &Move) -> bool {
    let Some(piece) = board.occupant(mv.from) else { return false; };
    let Some(king_at) = board.king(piece.color.opponent()) else { return false; };
    let Some(dir) = Direction::of_line(mv.to, king_at) else { return false; };
    match piece.kind {
        PieceType::Knight => dir == Direction::Knight,
        PieceType::King => false,
        PieceType::Pawn => {
            dir != Direction::Knight
                && can_attack(PieceType::Pawn, piece.color, dir)
                && chebyshev(mv.to, king_at) <= 1
        }
        kind => {
            dir != Direction::Knight
                && can_attack(kind, piece.color, dir)
                && Coord::between(mv.to, king_at)
                    .iter()
                    .all(|c| board.occupant(*c).is_none())
        }
    }
}

fn build_player(spec: &str, color: Color) -> Option<Box<dyn Player>> {
    match spec {
        "human" => Some(Box::new(HumanPlayer::new(color))),
        "computer1" => Some(Box::new(ComputerPlayer::new(color, 1))),
        "computer2" => Some(Box::new(ComputerPlayer::new(color, 2))),
        "computer3" => Some(Box::new(ComputerPlayer::new(color, 3))),
        _ => None,
    }
}

// --- Clock ---

/// Per-player countdown. Time is measured per turn and charged to the mover
/// when their move is applied; nothing ticks in the background.
#[derive(Debug, Clone)]
struct Clock {
    white_remaining: Duration,
    black_remaining: Duration,
    turn_start: Option<Instant>,
}

impl Clock {
    fn new(per_player: Duration) -> Self {
        Clock { white_remaining: per_player, black_remaining: per_player, turn_start: None }
    }

    fn start_turn(&mut self) {
        self.turn_start = Some(Instant::now());
    }

    fn charge(&mut self, color: Color, elapsed: Duration) {
        let slot = match color {
            Color::White => &mut self.white_remaining,
            Color::Black => &mut self.black_remaining,
        };
        *slot = slot.saturating_sub(elapsed);
    }

    /// Charges the time since the turn started against `color`.
    fn charge_since_turn_start(&mut self, color: Color) {
        let elapsed = self
            .turn_start
            .map(|start| Instant::now().saturating_duration_since(start))
            .unwrap_or(Duration::ZERO);
        self.charge(color, elapsed);
    }

    fn remaining(&self, color: Color) -> Duration {
        match color {
            Color::White => self.white_remaining,
            Color::Black => self.black_remaining,
        }
    }

    fn expired(&self, color: Color) -> bool {
        self.remaining(color) == Duration::ZERO
    }
}

fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let minutes = total_seconds / 60;
    let seconds = total_seconds % 60;
    format!("{:02}:{:02}", minutes, seconds)
}

// --- Game Results and Record ---

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
enum WinReason { Checkmate, Timeout, Resignation }

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
enum DrawReason { Stalemate }

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
enum GameResult {
    Win(Color, WinReason),
    Draw(DrawReason),
}

#[derive(Debug, Clone, Serialize)]
struct MoveStat {
    notation: String,
    player: Color,
    annotation: String, // "+", "#", or empty
}

#[derive(Debug, Serialize)]
struct GameRecord {
    result: Option<GameResult>,
    white_moves: Vec<MoveStat>,
    black_moves: Vec<MoveStat>,
    white_time_remaining: Duration,
    black_time_remaining: Duration,
}

/// What a successfully applied move did to the opponent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveOutcome { Normal, Check, Checkmate, Stalemate }

// --- Game ---

/// One session: the board, the two players of the current game, the setup
/// used to start games, clocks, the running move record, and session score.
struct Game {
    board: Board,
    setup: SetupGrid,
    start_color: Color,
    white: Option<Box<dyn Player>>,
    black: Option<Box<dyn Player>>,
    clock: Clock,
    record: Vec<MoveStat>,
    white_wins: f64,
    black_wins: f64,
}

impl Game {
    fn new() -> Self {
        Game {
            board: Board::new(),
            setup: DEFAULT_SETUP,
            start_color: Color::White,
            white: None,
            black: None,
            clock: Clock::new(Duration::from_secs(INITIAL_TIME_SECONDS)),
            record: Vec::new(),
            white_wins: 0.0,
            black_wins: 0.0,
        }
    }

    /// Starts a fresh game from the stored setup with the given players.
    fn start(&mut self, white: Box<dyn Player>, black: Box<dyn Player>) {
        self.board = Board::new();
        self.board.set_turn(self.start_color);
        self.board.init(&self.setup);
        self.white = Some(white);
        self.black = Some(black);
        self.clock = Clock::new(Duration::from_secs(INITIAL_TIME_SECONDS));
        self.record.clear();
    }

    /// Setup sanity: exactly one king per color, no pawns on the first or
    /// last row, and neither king already capturable in the arranged
    /// position.
    fn is_setup_valid(&self) -> bool {
        let mut white_kings = 0;
        let mut black_kings = 0;
        for (r, row) in self.setup.iter().enumerate() {
            for &symbol in row.iter() {
                match symbol {
                    'K' => white_kings += 1,
                    'k' => black_kings += 1,
                    'P' | 'p' if r == 0 || r == GRID_SIZE - 1 => return false,
                    _ => {}
                }
            }
        }
        if white_kings != 1 || black_kings != 1 {
            return false;
        }

        let mut probe = Board::new();
        probe.init(&self.setup);
        let king_capturable =
            |moves: &[Move]| moves.iter().any(|mv| mv.captured == Some(PieceType::King));
        !king_capturable(&probe.white_moves) && !king_capturable(&probe.black_moves)
    }

    /// Validates and applies one move for the side to move, charging the
    /// mover's clock and recording the annotated move.
    fn play(&mut self, mv: Move) -> Result<MoveOutcome, MoveError> {
        let mover = self.board.turn();
        match self.board.occupant(mv.from) {
            None => return Err(MoveError::EmptyOrigin(mv.from)),
            Some(p) if p.color != mover => return Err(MoveError::NotYourTurn(mv.from)),
            _ => {}
        }
        if !self.board.is_legal_move(&mv) {
            return Err(MoveError::Illegal(mv.notation()));
        }

        self.clock.charge_since_turn_start(mover);
        self.board.apply_move(&mv);

        let outcome = if self.board.is_checkmate() {
            MoveOutcome::Checkmate
        } else if self.board.is_stalemate() {
            MoveOutcome::Stalemate
        } else if self.board.is_check() {
            MoveOutcome::Check
        } else {
            MoveOutcome::Normal
        };

        let annotation = match outcome {
            MoveOutcome::Checkmate => "#",
            MoveOutcome::Check => "+",
            _ => "",
        };
        self.record.push(MoveStat {
            notation: mv.notation(),
            player: mover,
            annotation: annotation.to_string(),
        });
        self.clock.start_turn();
        Ok(outcome)
    }

    fn award(&mut self, result: GameResult) {
        match result {
            GameResult::Win(Color::White, _) => self.white_wins += 1.0,
            GameResult::Win(Color::Black, _) => self.black_wins += 1.0,
            GameResult::Draw(_) => {
                self.white_wins += 0.5;
                self.black_wins += 0.5;
            }
        }
    }

    /// Writes the current game's record to a JSON file.
    fn save_record(&self, filename: &str, result: Option<GameResult>) -> Result<(), RecordError> {
        let split = |color: Color| -> Vec<MoveStat> {
            self.record.iter().filter(|m| m.player == color).cloned().collect()
        };
        let record = GameRecord {
            result,
            white_moves: split(Color::White),
            black_moves: split(Color::Black),
            white_time_remaining: self.clock.remaining(Color::White),
            black_time_remaining: self.clock.remaining(Color::Black),
        };
        let json = serde_json::to_string_pretty(&record).map_err(RecordError::Serialization)?;
        fs::write(filename, json).map_err(|e| RecordError::Io(filename.to_string(), e))?;
        Ok(())
    }
}

// --- Custom Error Types ---

#[derive(Debug)]
enum MoveError {
    InvalidFormat(String),
    EmptyOrigin(Coord),
    NotYourTurn(Coord),
    Illegal(String),
}

impl fmt::Display for MoveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MoveError::InvalidFormat(input) => {
                write!(f, "Invalid move format: '{}'. Use squares like 'e2 e4'.", input)
            }
            MoveError::EmptyOrigin(at) => write!(f, "No piece found at {}", at),
            MoveError::NotYourTurn(at) => {
                write!(f, "The piece at {} does not belong to the side to move.", at)
            }
            MoveError::Illegal(mv) => write!(f, "Illegal move: '{}'", mv),
        }
    }
}

impl Error for MoveError {}

#[derive(Debug)]
enum RecordError {
    Serialization(serde_json::Error),
    Io(String, io::Error),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordError::Serialization(e) => write!(f, "Serialization error: {}", e),
            RecordError::Io(file, e) => write!(f, "I/O error with file '{}': {}", file, e),
        }
    }
}

impl Error for RecordError {}

#[derive(Debug)]
enum CommandError {
    UnknownCommand(String),
    MissingArgument(&'static str),
    InvalidArgument(String),
    Record(RecordError),
    Io(io::Error),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::UnknownCommand(cmd) => {
                write!(f, "Unknown command: '{}'. Type 'help' for commands.", cmd)
            }
            CommandError::MissingArgument(what) => write!(f, "Missing argument: {}", what),
            CommandError::InvalidArgument(arg) => write!(f, "Invalid argument: {}", arg),
            CommandError::Record(e) => write!(f, "Record save error: {}", e),
            CommandError::Io(e) => write!(f, "Input/Output error: {}", e),
        }
    }
}

impl Error for CommandError {}

impl From<RecordError> for CommandError {
    fn from(e: RecordError) -> Self { CommandError::Record(e) }
}

impl From<io::Error> for CommandError {
    fn from(e: io::Error) -> Self { CommandError::Io(e) }
}

impl From<MoveError> for CommandError {
    fn from(e: MoveError) -> Self { CommandError::InvalidArgument(e.to_string()) }
}

// --- Input Parsing ---

lazy_static! {
    static ref MOVE_ARGS_RE: Regex =
        Regex::new(r"^([a-h][1-8])\s*[-,]?\s*([a-h][1-8])$").expect("move pattern compiles");
    static ref SQUARE_RE: Regex = Regex::new(r"^[a-h][1-8]$").expect("square pattern compiles");
}

#[derive(Debug)]
enum SessionInput {
    NewGame(String, String),
    Setup,
    Help,
    Quit,
}

#[derive(Debug)]
enum PlayInput {
    /// A move request. The squares are present when the user typed them.
    Move(Option<(Coord, Coord)>),
    Resign,
    Help,
}

#[derive(Debug)]
enum SetupInput {
    Place(char, Coord),
    Remove(Coord),
    SetTurn(Color),
    Done,
}

fn parse_session_input(input: &str) -> Result<SessionInput, CommandError> {
    let mut parts = input.split_whitespace();
    let command = parts.next().unwrap_or("");
    match command {
        "game" => {
            let white = parts.next().ok_or(CommandError::MissingArgument("white player"))?;
            let black = parts.next().ok_or(CommandError::MissingArgument("black player"))?;
            Ok(SessionInput::NewGame(white.to_string(), black.to_string()))
        }
        "setup" => Ok(SessionInput::Setup),
        "help" | "?" => Ok(SessionInput::Help),
        "quit" | "exit" => Ok(SessionInput::Quit),
        other => Err(CommandError::UnknownCommand(other.to_string())),
    }
}

/// Parses a pair of squares like "e2 e4", "e2e4", or "e2-e4".
fn parse_squares(args: &str) -> Result<(Coord, Coord), MoveError> {
    let caps = MOVE_ARGS_RE
        .captures(args)
        .ok_or_else(|| MoveError::InvalidFormat(args.to_string()))?;
    let from = Coord::from_algebraic(&caps[1])
        .ok_or_else(|| MoveError::InvalidFormat(args.to_string()))?;
    let to = Coord::from_algebraic(&caps[2])
        .ok_or_else(|| MoveError::InvalidFormat(args.to_string()))?;
    Ok((from, to))
}

fn parse_play_input(input: &str) -> Result<PlayInput, CommandError> {
    let trimmed = input.trim();
    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or("");
    let args = parts.next().unwrap_or("").trim();

    match command {
        "move" => {
            if args.is_empty() {
                Ok(PlayInput::Move(None))
            } else {
                let squares = parse_squares(args)?;
                Ok(PlayInput::Move(Some(squares)))
            }
        }
        "resign" => Ok(PlayInput::Resign),
        "help" | "?" => Ok(PlayInput::Help),
        _ => {
            // A bare square pair also counts as a move request.
            match parse_squares(trimmed) {
                Ok(squares) => Ok(PlayInput::Move(Some(squares))),
                Err(_) => Err(CommandError::UnknownCommand(command.to_string())),
            }
        }
    }
}

fn parse_setup_input(input: &str) -> Result<SetupInput, CommandError> {
    let mut parts = input.split_whitespace();
    let command = parts.next().unwrap_or("");
    match command {
        "+" => {
            let piece = parts.next().ok_or(CommandError::MissingArgument("piece symbol"))?;
            let square = parts.next().ok_or(CommandError::MissingArgument("square"))?;
            let symbol = match piece {
                p if p.len() == 1 && "PRNBQKprnbqk".contains(p) => {
                    p.chars().next().expect("validated single symbol")
                }
                other => return Err(CommandError::InvalidArgument(format!(
                    "'{}' is not a piece symbol (use P R N B Q K, lowercase for Black)",
                    other
                ))),
            };
            let at = parse_setup_square(square)?;
            Ok(SetupInput::Place(symbol, at))
        }
        "-" => {
            let square = parts.next().ok_or(CommandError::MissingArgument("square"))?;
            let at = parse_setup_square(square)?;
            Ok(SetupInput::Remove(at))
        }
        "=" => {
            let colour = parts.next().ok_or(CommandError::MissingArgument("colour"))?;
            match colour {
                "white" => Ok(SetupInput::SetTurn(Color::White)),
                "black" => Ok(SetupInput::SetTurn(Color::Black)),
                other => Err(CommandError::InvalidArgument(format!(
                    "'{}' is not a colour (use white or black)",
                    other
                ))),
            }
        }
        "done" => Ok(SetupInput::Done),
        other => Err(CommandError::UnknownCommand(other.to_string())),
    }
}

fn parse_setup_square(s: &str) -> Result<Coord, CommandError> {
    if !SQUARE_RE.is_match(s) {
        return Err(CommandError::InvalidArgument(format!("'{}' is not a square", s)));
    }
    Coord::from_algebraic(s)
        .ok_or_else(|| CommandError::InvalidArgument(format!("'{}' is not a square", s)))
}

/// Reads one trimmed line from stdin; None means end of input.
fn read_line_opt() -> io::Result<Option<String>> {
    let mut buffer = String::new();
    match io::stdin().read_line(&mut buffer)? {
        0 => Ok(None),
        _ => Ok(Some(buffer.trim().to_string())),
    }
}

// --- Session Loop ---

fn main() -> Result<(), Box<dyn Error>> {
    let mut game = Game::new();

    println!();
    println!("==============================");
    println!("|     Signal Chess (CLI)     |");
    println!("==============================");
    println!("Welcome! Start a new game or set up the board.");
    print_session_help();

    'session: loop {
        println!();
        print!("Please enter a command: ");
        io::stdout().flush()?;

        let Some(line) = read_line_opt()? else { break 'session; };
        if line.is_empty() {
            continue;
        }

        match parse_session_input(&line) {
            Ok(SessionInput::NewGame(white_spec, black_spec)) => {
                let white = build_player(&white_spec, Color::White);
                let black = build_player(&black_spec, Color::Black);
                let (Some(white), Some(black)) = (white, black) else {
                    println!("Players must be one of: human, computer1, computer2, computer3.");
                    continue;
                };
                if !game.is_setup_valid() {
                    println!("The stored setup is not playable. Fix it in setup mode first.");
                    continue;
                }
                game.start(white, black);
                println!("Game starts: let's play!");
                if !run_game(&mut game)? {
                    break 'session; // stdin exhausted mid-game
                }
            }
            Ok(SessionInput::Setup) => {
                if !run_setup(&mut game)? {
                    break 'session;
                }
            }
            Ok(SessionInput::Help) => print_session_help(),
            Ok(SessionInput::Quit) => break 'session,
            Err(e) => println!("Input Error: {}", e),
        }
    }

    println!();
    println!("Final score:");
    println!("White: {}", game.white_wins);
    println!("Black: {}", game.black_wins);
    if game.white_wins > game.black_wins {
        println!("White wins the session!");
    } else if game.white_wins < game.black_wins {
        println!("Black wins the session!");
    } else {
        println!("Session is a draw!");
    }

    Ok(())
}

/// Runs one game to its conclusion. Returns false when stdin ran out, which
/// ends the whole session.
fn run_game(game: &mut Game) -> io::Result<bool> {
    game.clock.start_turn();

    let mut stdin_open = true;
    let result: Option<GameResult> = 'game_loop: loop {
        println!();
        println!("{}", game.board);
        println!(
            "White Time: {} | Black Time: {}",
            format_duration(game.clock.remaining(Color::White)),
            format_duration(game.clock.remaining(Color::Black)),
        );

        let mover = game.board.turn();
        print!("{:?}'s turn. Enter 'move <from> <to>' (or 'move' for a computer side): ", mover);
        io::stdout().flush()?;

        let Some(line) = read_line_opt()? else {
            stdin_open = false;
            break 'game_loop None;
        };
        if line.is_empty() {
            continue;
        }

        match parse_play_input(&line) {
            Ok(PlayInput::Move(typed)) => {
                let is_human = match mover {
                    Color::White => game.white.as_ref().map_or(true, |p| p.is_human()),
                    Color::Black => game.black.as_ref().map_or(true, |p| p.is_human()),
                };

                let mv = if is_human {
                    match typed {
                        Some((from, to)) => {
                            Move::new(from, to, game.board.occupant(to).map(|p| p.kind))
                        }
                        None => {
                            println!("A human move needs squares: move <from> <to>.");
                            continue;
                        }
                    }
                } else {
                    let Game { white, black, board, .. } = game;
                    let player = match mover {
                        Color::White => white.as_mut(),
                        Color::Black => black.as_mut(),
                    };
                    let Some(player) = player else {
                        println!("{:?} has no player assigned.", mover);
                        continue;
                    };
                    match player.pick_move(board) {
                        Some(mv) => {
                            println!("{:?} plays {}", player.color(), mv.notation());
                            mv
                        }
                        None => {
                            println!("{:?} has no move to play.", player.color());
                            continue;
                        }
                    }
                };

                match game.play(mv) {
                    Ok(outcome) => {
                        if game.clock.expired(mover) {
                            println!("{:?}'s flag fell. Time forfeit!", mover);
                            break 'game_loop Some(GameResult::Win(
                                mover.opponent(),
                                WinReason::Timeout,
                            ));
                        }
                        match outcome {
                            MoveOutcome::Checkmate => {
                                println!("{}", game.board);
                                println!("Checkmate! {:?} wins!", mover);
                                break 'game_loop Some(GameResult::Win(
                                    mover,
                                    WinReason::Checkmate,
                                ));
                            }
                            MoveOutcome::Stalemate => {
                                println!("{}", game.board);
                                println!("Stalemate! It's a draw.");
                                break 'game_loop Some(GameResult::Draw(DrawReason::Stalemate));
                            }
                            MoveOutcome::Check => {
                                println!("Check! {:?} is in check.", game.board.turn());
                            }
                            MoveOutcome::Normal => {}
                        }
                    }
                    Err(e) => println!("Error making move: {}", e),
                }
            }
            Ok(PlayInput::Resign) => {
                println!("{:?} resigns. {:?} wins!", mover, mover.opponent());
                break 'game_loop Some(GameResult::Win(mover.opponent(), WinReason::Resignation));
            }
            Ok(PlayInput::Help) => print_game_help(),
            Err(e) => println!("Input Error: {}", e),
        }
    };

    if let Some(result) = result {
        game.award(result);
    }
    println!("Moves played: {}", game.board.history().len());
    if let Err(e) = game.save_record(DEFAULT_RECORD_FILENAME, result) {
        eprintln!("Warning: failed to save the game record: {}", e);
    } else {
        println!("Game record saved to '{}'.", DEFAULT_RECORD_FILENAME);
    }

    Ok(stdin_open)
}

/// Setup mode: edit the stored arrangement a square at a time. Returns false
/// when stdin ran out.
fn run_setup(game: &mut Game) -> io::Result<bool> {
    print_setup_help();
    loop {
        print!("setup> ");
        io::stdout().flush()?;
        let Some(line) = read_line_opt()? else { return Ok(false); };
        if line.is_empty() {
            continue;
        }

        match parse_setup_input(&line) {
            Ok(SetupInput::Place(symbol, at)) => {
                game.setup[at.row_index()][at.col_index()] = symbol;
                print_setup(&game.setup);
                println!("Piece {} placed at {}", symbol, at);
            }
            Ok(SetupInput::Remove(at)) => {
                game.setup[at.row_index()][at.col_index()] =
                    blank_symbol(at.row_index(), at.col_index());
                print_setup(&game.setup);
                println!("Piece removed from {}", at);
            }
            Ok(SetupInput::SetTurn(color)) => {
                game.start_color = color;
                println!("Side to move set to {:?}", color);
            }
            Ok(SetupInput::Done) => {
                if game.is_setup_valid() {
                    println!("Setup complete!");
                    return Ok(true);
                }
                println!(
                    "Invalid setup. You need exactly one king per side, no pawns on the \
                     first or last row, and no king already in check."
                );
            }
            Err(e) => println!("Input Error: {}", e),
        }
    }
}

fn print_setup(setup: &SetupGrid) {
    for row in (0..GRID_SIZE).rev() {
        print!("{}  ", row + 1);
        for col in 0..GRID_SIZE {
            print!("{} ", setup[row][col]);
        }
        println!();
    }
    println!("\n   a b c d e f g h\n");
}

fn print_session_help() {
    println!();
    println!("--------------------------------------------------");
    println!("To start a game, type:");
    println!("  game <white_player> <black_player>");
    println!("  where each player is one of:");
    println!("  - human");
    println!("  - computer1 (random)");
    println!("  - computer2 (prefers captures and checks)");
    println!("  - computer3 (also avoids attacked squares)");
    println!("To edit the starting arrangement: setup");
    println!("To show this menu: help");
    println!("To leave (the session score is printed): quit");
    println!("--------------------------------------------------");
}

fn print_game_help() {
    println!();
    println!("During a game:");
    println!("  move <from> <to>   play a move, e.g. move e2 e4");
    println!("  move               let a computer side play its move");
    println!("  resign             concede the game");
    println!("  help               show this message");
}

fn print_setup_help() {
    println!();
    println!("--------------------------------------------------");
    println!("Setup commands:");
    println!("  + <piece> <square>   place a piece, e.g. + K e1");
    println!("  - <square>           clear a square, e.g. - e4");
    println!("  = <colour>           set the side to move, e.g. = white");
    println!("  done                 validate and leave setup mode");
    println!("--------------------------------------------------");
}

// --- Tests ---

#[cfg(test)]
mod tests {
    use super::*;

    fn coord(s: &str) -> Coord {
        Coord::from_algebraic(s).expect("test square")
    }

    fn empty_setup() -> SetupGrid {
        let mut setup = [[' '; GRID_SIZE]; GRID_SIZE];
        for (r, row) in setup.iter_mut().enumerate() {
            for (c, cell) in row.iter_mut().enumerate() {
                *cell = blank_symbol(r, c);
            }
        }
        setup
    }

    fn setup_with(pieces: &[(char, &str)]) -> SetupGrid {
        let mut setup = empty_setup();
        for (symbol, square) in pieces {
            let at = coord(square);
            setup[at.row_index()][at.col_index()] = *symbol;
        }
        setup
    }

    fn board_from(pieces: &[(char, &str)], turn: Color) -> Board {
        let mut board = Board::new();
        board.set_turn(turn);
        board.init(&setup_with(pieces));
        board
    }

    fn default_board() -> Board {
        let mut board = Board::new();
        board.init(&DEFAULT_SETUP);
        board
    }

    fn sorted_notations(moves: &[Move]) -> Vec<String> {
        let mut all: Vec<String> = moves.iter().map(|m| m.notation()).collect();
        all.sort();
        all.dedup();
        all
    }

    // -- Coordinates and directions --

    #[test]
    fn coordinate_letter_roundtrip() {
        let at = Coord::from_letter(4, 'e');
        assert_eq!(at.row(), 4);
        assert_eq!(at.col_letter(), 'e');
        assert_eq!(at.to_string(), "e4");
        assert_eq!(Coord::from_algebraic("e4"), Some(at));
        assert_eq!(Coord::from_algebraic("j4"), None);
        assert_eq!(Coord::from_algebraic("e9"), None);
    }

    #[test]
    fn between_identical_and_adjacent_is_empty() {
        let e4 = coord("e4");
        assert!(Coord::between(e4, e4).is_empty());
        assert!(Coord::between(e4, coord("e5")).is_empty());
        assert!(Coord::between(e4, coord("d3")).is_empty());
    }

    #[test]
    fn between_walks_files_ranks_and_diagonals() {
        let file: Vec<String> =
            Coord::between(coord("e2"), coord("e8")).iter().map(|c| c.to_string()).collect();
        assert_eq!(file, ["e3", "e4", "e5", "e6", "e7"]);

        let rank: Vec<String> =
            Coord::between(coord("h1"), coord("d1")).iter().map(|c| c.to_string()).collect();
        assert_eq!(rank, ["g1", "f1", "e1"]);

        let diagonal: Vec<String> =
            Coord::between(coord("a1"), coord("e5")).iter().map(|c| c.to_string()).collect();
        assert_eq!(diagonal, ["b2", "c3", "d4"]);
    }

    #[test]
    fn direction_offsets_and_reversal() {
        assert_eq!(Direction::from_offset(1, 0), Some(Direction::N));
        assert_eq!(Direction::from_offset(-1, 1), Some(Direction::SE));
        assert_eq!(Direction::from_offset(2, 1), Some(Direction::Knight));
        assert_eq!(Direction::from_offset(3, 0), None);
        assert_eq!(Direction::NE.reverse(), Direction::SW);
        assert_eq!(Direction::Knight.reverse(), Direction::Knight);
    }

    #[test]
    fn line_direction_normalizes_distance() {
        assert_eq!(Direction::of_line(coord("e2"), coord("e7")), Some(Direction::N));
        assert_eq!(Direction::of_line(coord("e2"), coord("a2")), Some(Direction::W));
        assert_eq!(Direction::of_line(coord("c1"), coord("g5")), Some(Direction::NE));
        assert_eq!(Direction::of_line(coord("b1"), coord("c3")), Some(Direction::Knight));
        assert_eq!(Direction::of_line(coord("b1"), coord("e3")), None);
        assert_eq!(Direction::of_line(coord("b1"), coord("b1")), None);
    }

    // -- Square response handlers, no grid involved --

    #[test]
    fn rook_records_move_from_matching_reply() {
        let mut square = Square::new(coord("e2"));
        square.occupant = Some(Piece::new(PieceType::Rook, Color::White));
        let reply = Signal {
            kind: SignalKind::Reply,
            color: None,
            piece: None,
            origin: coord("e5"),
            direction: Direction::N,
        };
        let emitted = square.respond(&reply, Direction::N);
        assert!(emitted.is_empty());
        assert_eq!(square.moves, vec![Move::new(coord("e2"), coord("e5"), None)]);
    }

    #[test]
    fn reply_with_mismatched_direction_is_ignored() {
        let mut square = Square::new(coord("e2"));
        square.occupant = Some(Piece::new(PieceType::Rook, Color::White));
        let reply = Signal {
            kind: SignalKind::Reply,
            color: None,
            piece: None,
            origin: coord("e5"),
            direction: Direction::N,
        };
        square.respond(&reply, Direction::NE);
        assert!(square.moves.is_empty());
    }

    #[test]
    fn king_ignores_replies_from_distant_squares() {
        let mut square = Square::new(coord("e1"));
        square.occupant = Some(Piece::new(PieceType::King, Color::White));
        let far = Signal {
            kind: SignalKind::Reply,
            color: None,
            piece: None,
            origin: coord("e4"),
            direction: Direction::N,
        };
        square.respond(&far, Direction::N);
        assert!(square.moves.is_empty());

        let near = Signal { origin: coord("e2"), ..far };
        square.respond(&near, Direction::N);
        assert_eq!(square.moves, vec![Move::new(coord("e1"), coord("e2"), None)]);
    }

    #[test]
    fn pawn_reply_rules() {
        let mut square = Square::new(coord("e2"));
        square.occupant = Some(Piece::new(PieceType::Pawn, Color::White));

        // Straight ahead, empty: a move.
        let ahead = Signal {
            kind: SignalKind::Reply,
            color: None,
            piece: None,
            origin: coord("e3"),
            direction: Direction::N,
        };
        square.respond(&ahead, Direction::N);
        // Two ahead, empty, from the start row: a move.
        let double = Signal { origin: coord("e4"), ..ahead };
        square.respond(&double, Direction::N);
        // Three ahead: no.
        let triple = Signal { origin: coord("e5"), ..ahead };
        square.respond(&triple, Direction::N);
        // Forward diagonal but empty: pawns do not capture air.
        let empty_diag = Signal { origin: coord("d3"), direction: Direction::NW, ..ahead };
        square.respond(&empty_diag, Direction::NW);
        // Forward diagonal with a hostile occupant: a capture.
        let hostile_diag = Signal {
            kind: SignalKind::Reply,
            color: Some(Color::Black),
            piece: Some(PieceType::Bishop),
            origin: coord("f3"),
            direction: Direction::NE,
        };
        square.respond(&hostile_diag, Direction::NE);
        // Hostile occupant straight ahead: blocked, not a capture.
        let hostile_ahead = Signal {
            kind: SignalKind::Reply,
            color: Some(Color::Black),
            piece: Some(PieceType::Rook),
            origin: coord("e3"),
            direction: Direction::N,
        };
        square.respond(&hostile_ahead, Direction::N);

        assert_eq!(
            sorted_notations(&square.moves),
            vec!["e2e3".to_string(), "e2e4".to_string(), "e2f3".to_string()]
        );
    }

    #[test]
    fn pawn_double_step_needs_start_row() {
        let mut square = Square::new(coord("e3"));
        square.occupant = Some(Piece::new(PieceType::Pawn, Color::White));
        let double = Signal {
            kind: SignalKind::Reply,
            color: None,
            piece: None,
            origin: coord("e5"),
            direction: Direction::N,
        };
        square.respond(&double, Direction::N);
        assert!(square.moves.is_empty());
    }

    #[test]
    fn protection_claims_are_vetted() {
        let mut square = Square::new(coord("e2"));
        square.occupant = Some(Piece::new(PieceType::Rook, Color::White));

        // A friendly king three squares away covers nothing.
        let far_king = Signal {
            kind: SignalKind::ReplyProtected,
            color: Some(Color::White),
            piece: Some(PieceType::King),
            origin: coord("e5"),
            direction: Direction::N,
        };
        square.respond(&far_king, Direction::N);
        assert!(!square.protected);

        // A friendly pawn behind this square does not defend it.
        let pawn_behind = Signal {
            kind: SignalKind::ReplyProtected,
            color: Some(Color::White),
            piece: Some(PieceType::Pawn),
            origin: coord("e1"),
            direction: Direction::S,
        };
        square.respond(&pawn_behind, Direction::S);
        assert!(!square.protected);

        // A friendly queen down the file does.
        let queen = Signal {
            kind: SignalKind::ReplyProtected,
            color: Some(Color::White),
            piece: Some(PieceType::Queen),
            origin: coord("e7"),
            direction: Direction::N,
        };
        square.respond(&queen, Direction::N);
        assert!(square.protected);
    }

    #[test]
    fn empty_square_relays_and_replies_along_the_ray() {
        let mut square = Square::new(coord("e4"));
        let relayed = Signal {
            kind: SignalKind::RelayUpdate,
            color: Some(Color::White),
            piece: Some(PieceType::Rook),
            origin: coord("e2"),
            direction: Direction::S,
        };
        let emitted = square.respond(&relayed, Direction::S);
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].kind, SignalKind::Reply);
        assert_eq!(emitted[0].origin, coord("e4"));
        assert_eq!(emitted[0].direction, Direction::N);
        assert_eq!(emitted[1].kind, SignalKind::RelayUpdate);
        assert_eq!(emitted[1].origin, coord("e2"));
        assert_eq!(emitted[1].direction, Direction::S);

        // Off-ray relays die.
        let emitted = square.respond(&relayed, Direction::W);
        assert!(emitted.is_empty());
    }

    #[test]
    fn pin_confirmation_collapses_moves_to_the_axis() {
        let mut square = Square::new(coord("e2"));
        square.occupant = Some(Piece::new(PieceType::Rook, Color::White));
        square.moves = vec![
            Move::new(coord("e2"), coord("e7"), None),
            Move::new(coord("e2"), coord("b2"), None),
            Move::new(coord("e2"), coord("e8"), Some(PieceType::Rook)),
        ];
        let confirm = Signal {
            kind: SignalKind::ProtectionConfirm,
            color: Some(Color::White),
            piece: Some(PieceType::King),
            origin: coord("e1"),
            direction: Direction::S,
        };
        square.respond(&confirm, Direction::S);
        assert_eq!(sorted_notations(&square.moves), vec!["e2e7".to_string(), "e2e8".to_string()]);
    }

    // -- Whole-board propagation --

    #[test]
    fn initial_position_has_twenty_moves_per_side() {
        let board = default_board();
        assert_eq!(board.moves_for(Color::White).len(), 20);
        assert_eq!(board.moves_for(Color::Black).len(), 20);

        let white = sorted_notations(board.moves_for(Color::White));
        for expected in ["e2e3", "e2e4", "b1a3", "b1c3", "g1f3", "g1h3"] {
            assert!(white.contains(&expected.to_string()), "missing {}", expected);
        }
        // No pawn drifts sideways onto an empty square.
        assert!(!white.contains(&"e2d3".to_string()));
    }

    #[test]
    fn initial_position_protection_flags() {
        let board = default_board();
        // The e2 pawn is defended by king, queen, and bishop.
        assert!(board.square(coord("e2")).protected);
        // The d2 pawn is defended by the queen and king.
        assert!(board.square(coord("d2")).protected);
        // Nobody defends the rook in the corner.
        assert!(!board.square(coord("a1")).protected);
    }

    #[test]
    fn blocked_pawn_can_only_capture_diagonally() {
        let board = board_from(
            &[('K', "a1"), ('k', "h8"), ('P', "e2"), ('p', "e3"), ('p', "d3")],
            Color::White,
        );
        let moves = sorted_notations(&board.square(coord("e2")).moves);
        assert_eq!(moves, vec!["e2d3".to_string()]);
        let capture = board.square(coord("e2")).moves[0];
        assert_eq!(capture.captured, Some(PieceType::Pawn));
    }

    #[test]
    fn pawn_stopped_by_piece_two_ahead_keeps_single_step() {
        let board = board_from(
            &[('K', "a1"), ('k', "h8"), ('P', "e2"), ('r', "e4")],
            Color::White,
        );
        let moves = sorted_notations(&board.square(coord("e2")).moves);
        assert_eq!(moves, vec!["e2e3".to_string()]);
    }

    #[test]
    fn sliders_see_through_empty_squares_until_blocked() {
        let board = board_from(&[('K', "a1"), ('k', "h8"), ('R', "d4"), ('p', "d7")], Color::White);
        let moves = sorted_notations(&board.square(coord("d4")).moves);
        let expected: Vec<String> = [
            "d4a4", "d4b4", "d4c4", "d4d1", "d4d2", "d4d3", "d4d5", "d4d6", "d4d7",
            "d4e4", "d4f4", "d4g4", "d4h4",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(moves, expected);
        // The capture carries the blocker's type; the file ends there.
        assert!(board
            .square(coord("d4"))
            .moves
            .iter()
            .any(|m| m.to == coord("d7") && m.captured == Some(PieceType::Pawn)));
        assert!(!moves.contains(&"d4d8".to_string()));
    }

    #[test]
    fn pinned_rook_is_restricted_to_the_pin_file() {
        let board = board_from(
            &[('K', "e1"), ('R', "e2"), ('r', "e8"), ('k', "h8")],
            Color::White,
        );
        let moves = sorted_notations(&board.square(coord("e2")).moves);
        let expected: Vec<String> = ["e2e3", "e2e4", "e2e5", "e2e6", "e2e7", "e2e8"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(moves, expected);
        assert!(board
            .square(coord("e2"))
            .moves
            .iter()
            .any(|m| m.to == coord("e8") && m.captured == Some(PieceType::Rook)));
    }

    #[test]
    fn pinned_knight_has_no_moves() {
        // The knight's jumps all leave the e-file, so the pin strips its
        // whole list.
        let board = board_from(
            &[('K', "e1"), ('N', "e2"), ('r', "e8"), ('k', "h8")],
            Color::White,
        );
        assert!(board.square(coord("e2")).moves.is_empty());
    }

    #[test]
    fn back_rank_mate_is_detected_and_narrows_to_nothing() {
        let mut board = board_from(
            &[('K', "g1"), ('P', "f2"), ('P', "g2"), ('P', "h2"), ('q', "b1"), ('k', "h8")],
            Color::White,
        );
        assert!(board.is_check());
        assert!(board.is_checkmate());
        assert!(board.current_moves().is_empty());
    }

    #[test]
    fn exposed_king_escapes_a_back_rank_check() {
        let mut board = board_from(&[('K', "g1"), ('q', "b1"), ('k', "h8")], Color::White);
        assert!(board.is_check());
        assert!(!board.is_checkmate());
        // f1 is covered along the rank and h1 lies behind the king on the
        // check ray, so only the forward squares remain.
        let narrowed = sorted_notations(board.current_moves());
        assert_eq!(
            narrowed,
            vec!["g1f2".to_string(), "g1g2".to_string(), "g1h2".to_string()]
        );
    }

    #[test]
    fn knight_check_allows_capture_or_king_step_only() {
        let mut board = board_from(
            &[('K', "h1"), ('R', "b3"), ('n', "g3"), ('k', "h8")],
            Color::White,
        );
        assert!(board.is_check());
        assert!(!board.is_checkmate());
        let narrowed = sorted_notations(board.current_moves());
        assert_eq!(
            narrowed,
            vec![
                "b3g3".to_string(),
                "h1g1".to_string(),
                "h1g2".to_string(),
                "h1h2".to_string()
            ]
        );
    }

    #[test]
    fn interposition_counts_as_a_check_response() {
        // The bishop cannot capture the rook but can block on the file.
        let mut board = board_from(
            &[('K', "e1"), ('B', "g5"), ('r', "e8"), ('k', "h8")],
            Color::White,
        );
        assert!(board.is_check());
        assert!(!board.is_checkmate());
        let narrowed = sorted_notations(board.current_moves());
        assert!(narrowed.contains(&"g5e3".to_string()), "blocking move missing: {:?}", narrowed);
        assert!(narrowed.contains(&"g5e7".to_string()), "blocking move missing: {:?}", narrowed);
        // The bishop's off-file moves are gone.
        assert!(!narrowed.contains(&"g5f6".to_string()));
    }

    #[test]
    fn stalemate_with_bare_king() {
        let mut board = board_from(&[('k', "a8"), ('K', "b6"), ('Q', "c7")], Color::Black);
        assert!(!board.is_check());
        assert!(!board.is_checkmate());
        assert!(board.is_stalemate());
    }

    #[test]
    fn initial_position_is_not_stalemate_or_check() {
        let mut board = default_board();
        assert!(!board.is_check());
        assert!(!board.is_checkmate());
        assert!(!board.is_stalemate());
    }

    #[test]
    fn king_cannot_capture_a_defended_piece() {
        // The black rook next to the king is covered by a bishop.
        let board = board_from(
            &[('K', "e1"), ('r', "e2"), ('b', "g4"), ('k', "h8")],
            Color::White,
        );
        let steps = sorted_notations(&board.king_steps(Color::White));
        assert!(!steps.contains(&"e1e2".to_string()), "king steps: {:?}", steps);
    }

    #[test]
    fn rebroadcast_of_settled_square_changes_nothing() {
        let mut board = default_board();
        let snapshot: Vec<(Vec<Move>, bool)> = board
            .grid
            .iter()
            .flatten()
            .map(|sq| (sq.moves.clone(), sq.protected))
            .collect();
        let white_before = sorted_notations(board.moves_for(Color::White));
        let black_before = sorted_notations(board.moves_for(Color::Black));

        board.rebroadcast(coord("e2"));
        board.rebroadcast(coord("e4"));

        let after: Vec<(Vec<Move>, bool)> = board
            .grid
            .iter()
            .flatten()
            .map(|sq| (sq.moves.clone(), sq.protected))
            .collect();
        let pairs = snapshot.iter().zip(after.iter());
        for ((before_moves, before_flag), (after_moves, after_flag)) in pairs {
            assert_eq!(sorted_notations(before_moves), sorted_notations(after_moves));
            assert_eq!(before_flag, after_flag);
        }
        assert_eq!(white_before, sorted_notations(board.moves_for(Color::White)));
        assert_eq!(black_before, sorted_notations(board.moves_for(Color::Black)));
    }

    #[test]
    fn applying_a_move_ripples_through_the_grid() {
        let mut board = default_board();
        let mv = Move::new(coord("e2"), coord("e4"), None);
        assert!(board.is_legal_move(&mv));
        board.apply_move(&mv);

        assert_eq!(board.turn(), Color::Black);
        assert_eq!(board.history(), &[mv]);
        assert!(board.occupant(coord("e2")).is_none());
        let pawn = board.occupant(coord("e4")).expect("pawn arrived");
        assert_eq!(pawn.kind, PieceType::Pawn);
        assert_eq!(pawn.move_count, 1);
        assert!(pawn.has_moved());

        // The pawn's new square offers the single advance, and the freed
        // diagonal now lets the queen and bishop out.
        let white = sorted_notations(board.moves_for(Color::White));
        assert!(white.contains(&"e4e5".to_string()));
        assert!(white.contains(&"d1e2".to_string()));
        assert!(white.contains(&"f1e2".to_string()));
        assert!(!white.contains(&"e2e3".to_string()));
    }

    #[test]
    fn capture_removes_the_victim_from_its_side() {
        let mut board = board_from(
            &[('K', "e1"), ('R', "a1"), ('p', "a7"), ('k', "e8")],
            Color::White,
        );
        let capture = Move::new(coord("a1"), coord("a7"), Some(PieceType::Pawn));
        assert!(board.is_legal_move(&capture));
        board.apply_move(&capture);
        assert_eq!(
            board.occupant(coord("a7")).map(|p| (p.kind, p.color)),
            Some((PieceType::Rook, Color::White))
        );
        assert!(!board.moves_for(Color::Black).iter().any(|m| m.from == coord("a7")));
    }

    #[test]
    fn pop_move_is_bookkeeping_only() {
        let mut board = default_board();
        let mv = Move::new(coord("g1"), coord("f3"), None);
        board.apply_move(&mv);
        assert_eq!(board.pop_move(), Some(mv));
        assert!(board.history().is_empty());
        // The grid still shows the knight on f3; popping is not undo.
        assert_eq!(board.occupant(coord("f3")).map(|p| p.kind), Some(PieceType::Knight));
    }

    #[test]
    fn check_depends_on_open_lines() {
        let open = board_from(&[('K', "e1"), ('R', "e4"), ('k', "e8")], Color::Black);
        assert!(open.is_check());
        let blocked = board_from(
            &[('K', "e1"), ('R', "e4"), ('p', "e6"), ('k', "e8")],
            Color::Black,
        );
        assert!(!blocked.is_check());
    }

    #[test]
    fn text_display_tracks_occupancy() {
        let mut board = default_board();
        let shown = board.to_string();
        assert!(shown.contains("8 r n b q k b n r"));
        assert!(shown.contains("1 R N B Q K B N R"));

        board.apply_move(&Move::new(coord("e2"), coord("e4"), None));
        let shown = board.to_string();
        // Rank 2 lost its e-pawn, rank 4 gained one.
        assert!(shown.contains("2 P P P P _ P P P"));
        let rank_four = shown.lines().find(|l| l.starts_with("4 ")).expect("rank 4 line");
        assert!(rank_four.contains('P'), "no pawn shown on rank 4: {}", rank_four);
    }

    // -- Setup validation --

    #[test]
    fn default_setup_is_valid() {
        assert!(Game::new().is_setup_valid());
    }

    #[test]
    fn setup_rejects_wrong_king_counts() {
        let mut game = Game::new();
        game.setup = setup_with(&[('K', "e1"), ('K', "d1"), ('k', "e8")]);
        assert!(!game.is_setup_valid());
        game.setup = setup_with(&[('K', "e1")]);
        assert!(!game.is_setup_valid());
    }

    #[test]
    fn setup_rejects_pawns_on_end_rows() {
        let mut game = Game::new();
        game.setup = setup_with(&[('K', "e1"), ('k', "e8"), ('P', "a8")]);
        assert!(!game.is_setup_valid());
        game.setup = setup_with(&[('K', "e1"), ('k', "e8"), ('p', "c1")]);
        assert!(!game.is_setup_valid());
    }

    #[test]
    fn setup_rejects_a_king_already_in_check() {
        let mut game = Game::new();
        game.setup = setup_with(&[('K', "e1"), ('R', "e4"), ('k', "e8")]);
        assert!(!game.is_setup_valid());
    }

    // -- Players --

    #[test]
    fn random_computer_plays_a_legal_move() {
        let board = default_board();
        let mut player = ComputerPlayer::new(Color::White, 1);
        let mv = player.pick_move(&board).expect("a move exists");
        assert!(board.moves_for(Color::White).contains(&mv));
    }

    #[test]
    fn capture_preferring_computer_takes_the_pawn() {
        let board = board_from(
            &[('K', "e1"), ('R', "a1"), ('p', "a7"), ('k', "e8")],
            Color::White,
        );
        let mut player = ComputerPlayer::new(Color::White, 2);
        let mv = player.pick_move(&board).expect("a move exists");
        assert_eq!(mv, Move::new(coord("a1"), coord("a7"), Some(PieceType::Pawn)));
    }

    #[test]
    fn cautious_computer_declines_a_defended_pawn() {
        let board = board_from(
            &[('K', "e2"), ('R', "a1"), ('p', "a7"), ('r', "a8"), ('k', "h8")],
            Color::White,
        );
        let mut player = ComputerPlayer::new(Color::White, 3);
        let mv = player.pick_move(&board).expect("a move exists");
        assert_ne!(mv.to, coord("a7"), "took the defended pawn: {}", mv.notation());
    }

    #[test]
    fn human_player_defers_to_typed_input() {
        let board = default_board();
        let mut player = HumanPlayer::new(Color::White);
        assert!(player.is_human());
        assert!(player.pick_move(&board).is_none());
    }

    // -- Session plumbing --

    #[test]
    fn clock_charges_the_mover_only() {
        let mut clock = Clock::new(Duration::from_secs(60));
        clock.charge(Color::White, Duration::from_secs(12));
        assert_eq!(clock.remaining(Color::White), Duration::from_secs(48));
        assert_eq!(clock.remaining(Color::Black), Duration::from_secs(60));
        clock.charge(Color::White, Duration::from_secs(100));
        assert!(clock.expired(Color::White));
        assert!(!clock.expired(Color::Black));
    }

    #[test]
    fn game_play_validates_and_records() {
        let mut game = Game::new();
        game.start(
            Box::new(HumanPlayer::new(Color::White)),
            Box::new(HumanPlayer::new(Color::Black)),
        );

        let bad = Move::new(coord("e4"), coord("e5"), None);
        assert!(matches!(game.play(bad), Err(MoveError::EmptyOrigin(_))));

        let wrong_side = Move::new(coord("e7"), coord("e5"), None);
        assert!(matches!(game.play(wrong_side), Err(MoveError::NotYourTurn(_))));

        let illegal = Move::new(coord("a1"), coord("a5"), None);
        assert!(matches!(game.play(illegal), Err(MoveError::Illegal(_))));

        let opening = Move::new(coord("e2"), coord("e4"), None);
        assert_eq!(game.play(opening).expect("legal"), MoveOutcome::Normal);
        assert_eq!(game.record.len(), 1);
        assert_eq!(game.record[0].notation, "e2e4");
        assert_eq!(game.record[0].player, Color::White);
    }

    #[test]
    fn game_reports_check_and_mate_outcomes() {
        let mut game = Game::new();
        game.setup = setup_with(&[('K', "g1"), ('P', "f2"), ('P', "g2"), ('P', "h2"),
                                  ('q', "b4"), ('k', "h8")]);
        game.start_color = Color::Black;
        game.start(
            Box::new(HumanPlayer::new(Color::White)),
            Box::new(HumanPlayer::new(Color::Black)),
        );
        let mate = Move::new(coord("b4"), coord("b1"), None);
        assert_eq!(game.play(mate).expect("legal"), MoveOutcome::Checkmate);
        assert_eq!(game.record[0].annotation, "#");
    }

    #[test]
    fn game_record_serializes() {
        let mut game = Game::new();
        game.record.push(MoveStat {
            notation: "e2e4".to_string(),
            player: Color::White,
            annotation: String::new(),
        });
        let record = GameRecord {
            result: Some(GameResult::Win(Color::White, WinReason::Checkmate)),
            white_moves: game.record.clone(),
            black_moves: Vec::new(),
            white_time_remaining: game.clock.remaining(Color::White),
            black_time_remaining: game.clock.remaining(Color::Black),
        };
        let json = serde_json::to_string_pretty(&record).expect("serializes");
        assert!(json.contains("e2e4"));
        assert!(json.contains("Checkmate"));
    }

    // -- Parsing --

    #[test]
    fn move_input_forms_are_accepted() {
        for input in ["e2 e4", "e2e4", "e2-e4", "e2, e4"] {
            let (from, to) = parse_squares(input).expect(input);
            assert_eq!(from, coord("e2"));
            assert_eq!(to, coord("e4"));
        }
        assert!(parse_squares("e9 e4").is_err());
        assert!(parse_squares("e2").is_err());
    }

    #[test]
    fn play_input_commands_parse() {
        assert!(matches!(parse_play_input("resign"), Ok(PlayInput::Resign)));
        assert!(matches!(parse_play_input("move"), Ok(PlayInput::Move(None))));
        assert!(matches!(parse_play_input("move e2 e4"), Ok(PlayInput::Move(Some(_)))));
        assert!(matches!(parse_play_input("e2 e4"), Ok(PlayInput::Move(Some(_)))));
        assert!(parse_play_input("castle").is_err());
    }

    #[test]
    fn session_and_setup_commands_parse() {
        assert!(matches!(
            parse_session_input("game human computer2"),
            Ok(SessionInput::NewGame(_, _))
        ));
        assert!(matches!(parse_session_input("game human"), Err(CommandError::MissingArgument(_))));
        assert!(matches!(parse_setup_input("+ K e1"), Ok(SetupInput::Place('K', _))));
        assert!(matches!(parse_setup_input("- e4"), Ok(SetupInput::Remove(_))));
        assert!(matches!(parse_setup_input("= black"), Ok(SetupInput::SetTurn(Color::Black))));
        assert!(matches!(parse_setup_input("done"), Ok(SetupInput::Done)));
        assert!(parse_setup_input("+ X e1").is_err());
        assert!(parse_setup_input("+ K e9").is_err());
    }
}
