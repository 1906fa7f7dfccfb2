//! Scoring model.
//! Maps canonical board points to a sector and multiplier and draws the
//! sector overlay on rectified frames.

use std::fmt;

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use nalgebra::Point2;

/// Clockwise from 12 o'clock.
pub const SECTOR_ORDER: [u8; 20] = [20, 1, 18, 4, 13, 6, 10, 15, 2, 17, 3, 19, 7, 16, 8, 11, 14, 9, 12, 5];
/// Start angle of the first wedge, degrees from +x with y pointing down.
pub const FIRST_WEDGE_DEG: f64 = -99.0;
pub const WEDGE_DEG: f64 = 18.0;
const LABEL_RADIUS: f64 = 0.75;

const WEDGE_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
const LABEL_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// Ring boundaries as fractions of the board size in pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RingFractions {
    pub bullseye: f64,
    pub outer_bull: f64,
    pub triple: (f64, f64),
    pub double: (f64, f64),
}

impl Default for RingFractions {
    fn default() -> Self {
        Self {
            bullseye: 0.05,
            outer_bull: 0.10,
            triple: (0.38, 0.41),
            double: (0.63, 0.66),
        }
    }
}

impl RingFractions {
    /// Regulation ring radii (mm) scaled so the double ring's outer edge
    /// lands on a detected perimeter of `perimeter_radius` pixels.
    pub fn regulation(perimeter_radius: f64, board_size: f64) -> Self {
        const DOUBLE_OUTER_MM: f64 = 170.0;
        let f = |mm: f64| mm / DOUBLE_OUTER_MM * perimeter_radius / board_size;
        Self {
            bullseye: f(6.35),
            outer_bull: f(15.9),
            triple: (f(99.0), f(107.0)),
            double: (f(162.0), f(170.0)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScoringArea {
    Bullseye,
    OuterBull,
    Triple,
    Double,
    Single,
}

impl ScoringArea {
    pub fn multiplier(self) -> u8 {
        match self {
            ScoringArea::Triple => 3,
            ScoringArea::Double => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for ScoringArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScoringArea::Bullseye => "Bullseye",
            ScoringArea::OuterBull => "Outer Bull",
            ScoringArea::Triple => "Triple",
            ScoringArea::Double => "Double",
            ScoringArea::Single => "Single",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Score {
    /// Wedge number under the point; also set for bull hits.
    pub sector: u8,
    pub area: ScoringArea,
}

impl Score {
    pub fn multiplier(&self) -> u8 {
        self.area.multiplier()
    }

    pub fn label(&self) -> String {
        match self.area {
            ScoringArea::Bullseye | ScoringArea::OuterBull => "Bull".to_string(),
            _ => self.sector.to_string(),
        }
    }

    pub fn points(&self) -> u32 {
        match self.area {
            ScoringArea::Bullseye => 50,
            ScoringArea::OuterBull => 25,
            _ => self.sector as u32 * self.multiplier() as u32,
        }
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} (x{}, {} pts)", self.area, self.label(), self.multiplier(), self.points())
    }
}

/// Wedge number for an angle in degrees (image convention, y down).
pub fn sector_at(angle_deg: f64) -> u8 {
    let idx = ((angle_deg - FIRST_WEDGE_DEG).rem_euclid(360.0) / WEDGE_DEG) as usize;
    SECTOR_ORDER[idx.min(SECTOR_ORDER.len() - 1)]
}

pub fn sector_and_multiplier(point: Point2<f64>, board_size: u32) -> Score {
    sector_and_multiplier_with(point, board_size, &RingFractions::default())
}

/// Classifies `point` on a `board_size` square canvas centred at
/// `board_size / 2`.
pub fn sector_and_multiplier_with(point: Point2<f64>, board_size: u32, rings: &RingFractions) -> Score {
    let size = board_size as f64;
    let c = size / 2.0;
    let (dx, dy) = (point.x - c, point.y - c);
    let distance = dx.hypot(dy);
    let sector = sector_at(dy.atan2(dx).to_degrees());

    let area = if distance < size * rings.bullseye {
        ScoringArea::Bullseye
    } else if distance < size * rings.outer_bull {
        ScoringArea::OuterBull
    } else if distance > size * rings.triple.0 && distance < size * rings.triple.1 {
        ScoringArea::Triple
    } else if distance > size * rings.double.0 && distance < size * rings.double.1 {
        ScoringArea::Double
    } else {
        ScoringArea::Single
    };
    Score { sector, area }
}

/// Draws the twenty wedge boundaries and their numbers. The centre is the
/// image centre shifted by `offset` to allow manual fine tuning.
pub fn render_overlay(image: &RgbImage, offset: (i32, i32)) -> RgbImage {
    let mut out = image.clone();
    let cx = (image.width() / 2) as i32 + offset.0;
    let cy = (image.height() / 2) as i32 + offset.1;
    let radius = (image.width() / 2) as f64;
    let scale = (image.width() / 200).clamp(1, 4);

    for (i, number) in SECTOR_ORDER.iter().enumerate() {
        let start = (FIRST_WEDGE_DEG + i as f64 * WEDGE_DEG).to_radians();
        let end = start + WEDGE_DEG.to_radians();

        for a in [start, end] {
            let x = cx as f64 + radius * a.cos();
            let y = cy as f64 + radius * a.sin();
            draw_line_segment_mut(&mut out, (cx as f32, cy as f32), (x as f32, y as f32), WEDGE_COLOR);
        }

        let mid = 0.5 * (start + end);
        let tx = cx as f64 + radius * LABEL_RADIUS * mid.cos();
        let ty = cy as f64 + radius * LABEL_RADIUS * mid.sin();
        draw_number(&mut out, *number as u32, (tx as i32, ty as i32), scale, LABEL_COLOR);
    }
    out
}

// 3x5 glyphs, one row per entry, bit 2 is the leftmost column.
const DIGITS: [[u8; 5]; 10] = [
    [0b111, 0b101, 0b101, 0b101, 0b111],
    [0b010, 0b110, 0b010, 0b010, 0b111],
    [0b111, 0b001, 0b111, 0b100, 0b111],
    [0b111, 0b001, 0b111, 0b001, 0b111],
    [0b101, 0b101, 0b111, 0b001, 0b001],
    [0b111, 0b100, 0b111, 0b001, 0b111],
    [0b111, 0b100, 0b111, 0b101, 0b111],
    [0b111, 0b001, 0b010, 0b010, 0b010],
    [0b111, 0b101, 0b111, 0b101, 0b111],
    [0b111, 0b101, 0b111, 0b001, 0b111],
];

/// Draws `value` centred on `center` with square pixels of `scale`.
pub fn draw_number(image: &mut RgbImage, value: u32, center: (i32, i32), scale: u32, color: Rgb<u8>) {
    let digits: Vec<usize> = value
        .to_string()
        .bytes()
        .map(|b| (b - b'0') as usize)
        .collect();
    let s = scale.max(1) as i32;
    let glyph_w = 4 * s;
    let total_w = digits.len() as i32 * glyph_w - s;
    let left = center.0 - total_w / 2;
    let top = center.1 - 5 * s / 2;

    for (n, d) in digits.iter().enumerate() {
        for (row, bits) in DIGITS[*d].iter().enumerate() {
            for col in 0..3 {
                if bits & (0b100 >> col) != 0 {
                    let x = left + n as i32 * glyph_w + col * s;
                    let y = top + row as i32 * s;
                    draw_filled_rect_mut(image, Rect::at(x, y).of_size(s as u32, s as u32), color);
                }
            }
        }
    }
}
