use crate::axes::{Axes, Axis};
use crate::error::{Error, Result};

// Convolution and pooling geometry
//
// Layouts are fixed by axis position:
//
//   input   (C, D, H, W, N)   N is the single batch axis
//   filter  (C, T, R, S, K)
//   output  (K, M, P, Q, N)
//
// Spatial padding and stride are given per (D, H, W); pooling also pools
// over channels, so its window, padding and stride are per (C, D, H, W).

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConvParams {
    pub pad: [usize; 3],
    pub stride: [usize; 3],
}

impl Default for ConvParams {
    fn default() -> Self {
        ConvParams {
            pad: [0; 3],
            stride: [1; 3],
        }
    }
}

impl ConvParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_padding(mut self, pad: [usize; 3]) -> Self {
        self.pad = pad;
        self
    }

    pub fn with_stride(mut self, stride: [usize; 3]) -> Self {
        self.stride = stride;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolOp {
    Max,
    Avg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolParams {
    pub op: PoolOp,
    /// Window (J, T, R, S) over (C, D, H, W).
    pub window: [usize; 4],
    pub pad: [usize; 4],
    pub stride: [usize; 4],
}

impl PoolParams {
    pub fn max(window: [usize; 4]) -> Self {
        PoolParams {
            op: PoolOp::Max,
            window,
            pad: [0; 4],
            stride: [1; 4],
        }
    }

    pub fn avg(window: [usize; 4]) -> Self {
        PoolParams {
            op: PoolOp::Avg,
            ..Self::max(window)
        }
    }

    pub fn with_padding(mut self, pad: [usize; 4]) -> Self {
        self.pad = pad;
        self
    }

    pub fn with_stride(mut self, stride: [usize; 4]) -> Self {
        self.stride = stride;
        self
    }
}

/// Output length of a window of `s` taps sliding over `x` cells.
pub fn output_dim(x: usize, s: usize, pad: usize, stride: usize) -> Result<usize> {
    if stride == 0 {
        return Err(Error::Configuration("stride must be positive".into()));
    }
    if x + 2 * pad < s {
        return Err(Error::Configuration(format!(
            "window of {} does not fit {} cells with padding {}",
            s, x, pad
        )));
    }
    Ok((x + 2 * pad - s) / stride + 1)
}

fn batch_axis(input: &Axes, what: &str) -> Result<Axis> {
    if input.len() != 5 {
        return Err(Error::axis(format!(
            "{} input must have 5 axes (C, D, H, W, N), found {}",
            what,
            input.len()
        )));
    }
    let batch = input.batch_axes();
    if batch.len() != 1 || !input[4].is_batch() {
        return Err(Error::axis(format!(
            "{} input must end in its only batch axis, found {}",
            what, input
        )));
    }
    Ok(input[4].clone())
}

fn output_axes(lengths: [usize; 4], batch: Axis) -> Axes {
    let names = ["C", "D", "H", "W"];
    let mut axes: Vec<Axis> = names
        .iter()
        .zip(lengths)
        .map(|(name, len)| Axis::named(*name, len))
        .collect();
    axes.push(batch);
    Axes::new(axes)
}

/// Output axes (K, M, P, Q, N) of a convolution.
pub fn conv_output_axes(input: &Axes, filter: &Axes, params: &ConvParams) -> Result<Axes> {
    let batch = batch_axis(input, "convolution")?;
    if filter.len() != 5 {
        return Err(Error::axis(format!(
            "convolution filter must have 5 axes (C, T, R, S, K), found {}",
            filter.len()
        )));
    }
    if input[0].length() != filter[0].length() {
        return Err(Error::axis(format!(
            "input channels {} do not match filter channels {}",
            input[0], filter[0]
        )));
    }
    let i = input.lengths();
    let f = filter.lengths();
    let m = output_dim(i[1], f[1], params.pad[0], params.stride[0])?;
    let p = output_dim(i[2], f[2], params.pad[1], params.stride[1])?;
    let q = output_dim(i[3], f[3], params.pad[2], params.stride[2])?;
    Ok(output_axes([f[4], m, p, q], batch))
}

/// Output axes (K, M, P, Q, N) of a pooling.
pub fn pool_output_axes(input: &Axes, params: &PoolParams) -> Result<Axes> {
    let batch = batch_axis(input, "pooling")?;
    let i = input.lengths();
    let mut out = [0; 4];
    for d in 0..4 {
        if params.pad[d] >= params.window[d] && params.window[d] > 0 {
            return Err(Error::Configuration(format!(
                "pooling padding {} must be smaller than window {}",
                params.pad[d], params.window[d]
            )));
        }
        out[d] = output_dim(i[d], params.window[d], params.pad[d], params.stride[d])?;
    }
    Ok(output_axes(out, batch))
}
