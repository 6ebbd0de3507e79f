//! Colormaps used by the figures

/// ColorBrewer RdBu anchors, reversed so low values are blue.
const RDBU_R: [[u8; 3]; 11] = [
    [5, 48, 97],
    [33, 102, 172],
    [67, 147, 195],
    [146, 197, 222],
    [209, 229, 240],
    [247, 247, 247],
    [253, 219, 199],
    [244, 165, 130],
    [214, 96, 77],
    [178, 24, 43],
    [103, 0, 31],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Colormap {
    /// Diverging blue-white-red.
    RdBuR,
    /// Blue-cyan-yellow-red rainbow.
    Jet,
}

impl Colormap {
    /// Color for `t` in `[0, 1]`; values outside are clamped, NaN maps to 0.
    pub fn rgb(self, t: f32) -> [u8; 3] {
        let t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
        match self {
            Colormap::RdBuR => interpolate(&RDBU_R, t),
            Colormap::Jet => {
                let channel = |center: f32| to_u8((1.5 - (4.0 * t - center).abs()).clamp(0.0, 1.0));
                [channel(3.0), channel(2.0), channel(1.0)]
            }
        }
    }
}

fn interpolate(anchors: &[[u8; 3]], t: f32) -> [u8; 3] {
    let last = anchors.len() - 1;
    let pos = t * last as f32;
    let i = (pos.floor() as usize).min(last - 1);
    let frac = pos - i as f32;
    let (a, b) = (anchors[i], anchors[i + 1]);
    let mix = |k: usize| to_u8((a[k] as f32 + (b[k] as f32 - a[k] as f32) * frac) / 255.0);
    [mix(0), mix(1), mix(2)]
}

fn to_u8(v: f32) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}
