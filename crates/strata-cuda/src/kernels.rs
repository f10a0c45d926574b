// Kernels: CUDA source shared by every compiled module
//
// PRELUDE is prepended to every generated fused kernel and to the native
// library. It holds the typed load/store helpers generated code calls
// (ld_f32, st_i64, ...), with F16 going through inline PTX conversions,
// and the index helpers the native kernels share.
//
// The native library is written once over a placeholder element type and
// expanded for f32 and f64; function names carry the suffix
// (matmul_f32, conv_fprop_f64, ...). Natives work on dense row-major
// operands in the fixed layouts
//
//   input   (C, D, H, W, N)
//   filter  (C, T, R, S, K)
//   output  (K, M, P, Q, N)
//
// and read their integer geometry from a `meta` array in device memory.
// Every output element has a single writer, so no kernel needs atomics.

use strata_core::dtype::DType;

pub const NATIVE_MODULE: &str = "strata_native";

/// Native kernels, without their dtype suffix.
pub const NATIVE_KERNELS: &[&str] = &[
    "fill_strided",
    "copy_strided",
    "matmul",
    "conv_fprop",
    "conv_bprop",
    "conv_update",
    "pool_fprop",
    "pool_bprop",
];

/// Side of the square tiles `matmul` stages through shared memory.
pub const MATMUL_TILE: u32 = 16;

pub const PRELUDE: &str = r#"
#ifndef INFINITY
#define INFINITY __longlong_as_double(0x7ff0000000000000ULL)
#endif
#ifndef NAN
#define NAN __longlong_as_double(0x7ff8000000000000ULL)
#endif

__device__ __forceinline__ float f16_to_f32(unsigned short h) {
    float f;
    asm("{ cvt.f32.f16 %0, %1; }" : "=f"(f) : "h"(h));
    return f;
}

__device__ __forceinline__ unsigned short f32_to_f16(float f) {
    unsigned short h;
    asm("{ cvt.rn.f16.f32 %0, %1; }" : "=h"(h) : "f"(f));
    return h;
}

__device__ __forceinline__ double ld_f16(const unsigned char* p, long long i) {
    return (double)f16_to_f32(((const unsigned short*)p)[i]);
}
__device__ __forceinline__ void st_f16(unsigned char* p, long long i, double v) {
    ((unsigned short*)p)[i] = f32_to_f16((float)v);
}
__device__ __forceinline__ double ld_f32(const unsigned char* p, long long i) {
    return (double)((const float*)p)[i];
}
__device__ __forceinline__ void st_f32(unsigned char* p, long long i, double v) {
    ((float*)p)[i] = (float)v;
}
__device__ __forceinline__ double ld_f64(const unsigned char* p, long long i) {
    return ((const double*)p)[i];
}
__device__ __forceinline__ void st_f64(unsigned char* p, long long i, double v) {
    ((double*)p)[i] = v;
}
__device__ __forceinline__ double ld_i64(const unsigned char* p, long long i) {
    return (double)((const long long*)p)[i];
}
__device__ __forceinline__ void st_i64(unsigned char* p, long long i, double v) {
    ((long long*)p)[i] = (long long)v;
}
__device__ __forceinline__ double ld_bool(const unsigned char* p, long long i) {
    return p[i] != 0 ? 1.0 : 0.0;
}
__device__ __forceinline__ void st_bool(unsigned char* p, long long i, double v) {
    p[i] = v != 0.0 ? 1 : 0;
}

// Buffer index of logical element i of a row-major walk over dims.
__device__ __forceinline__ long long strided_index(
    long long i, long long ndim, const long long* dims, const long long* strides
) {
    long long idx = 0;
    for (long long d = ndim - 1; d >= 0; d--) {
        idx += (i % dims[d]) * strides[d];
        i /= dims[d];
    }
    return idx;
}

// Outputs k (of len) whose window [k*stride - pad, +window) holds x.
__device__ __forceinline__ void window_range(
    long long x, long long window, long long pad, long long stride, long long len,
    long long* kmin, long long* kmax
) {
    long long lo = x + pad - window + 1;
    *kmin = lo <= 0 ? 0 : (lo + stride - 1) / stride;
    long long hi = (x + pad) / stride;
    *kmax = hi < len - 1 ? hi : len - 1;
}

// Cells of window k left after clipping it to [0, extent).
__device__ __forceinline__ long long clipped(
    long long k, long long window, long long pad, long long stride, long long extent,
    long long* start
) {
    long long lo = k * stride - pad;
    long long hi = lo + window;
    if (lo < 0) lo = 0;
    if (hi > extent) hi = extent;
    *start = lo;
    return hi > lo ? hi - lo : 0;
}

#define GRID_LOOP(i, n) \
    for (long long i = (long long)blockIdx.x * blockDim.x + threadIdx.x; i < (n); \
         i += (long long)gridDim.x * blockDim.x)
"#;

const NATIVE_TEMPLATE: &str = r#"
// meta: ndim, n, dims[ndim], strides[ndim]
extern "C" __global__ void fill_strided_$S($T* out, double value, const long long* meta) {
    const long long ndim = meta[0];
    const long long* dims = meta + 2;
    const long long* strides = dims + ndim;
    GRID_LOOP(i, meta[1]) {
        out[strided_index(i, ndim, dims, strides)] = ($T)value;
    }
}

// meta: ndim, n, dims[ndim], x strides[ndim], out strides[ndim]
extern "C" __global__ void copy_strided_$S(const $T* x, $T* out, const long long* meta) {
    const long long ndim = meta[0];
    const long long* dims = meta + 2;
    const long long* xs = dims + ndim;
    const long long* os = xs + ndim;
    GRID_LOOP(i, meta[1]) {
        out[strided_index(i, ndim, dims, os)] = x[strided_index(i, ndim, dims, xs)];
    }
}

// meta: m, k, n. Launched over (n / TILE, m / TILE) blocks of TILE x TILE.
extern "C" __global__ void matmul_$S(const $T* a, const $T* b, $T* c, const long long* meta) {
    const long long m = meta[0], k = meta[1], n = meta[2];
    __shared__ $T ta[16][16];
    __shared__ $T tb[16][16];
    const long long row = (long long)blockIdx.y * 16 + threadIdx.y;
    const long long col = (long long)blockIdx.x * 16 + threadIdx.x;
    $T acc = 0;
    for (long long t = 0; t < k; t += 16) {
        ta[threadIdx.y][threadIdx.x] =
            (row < m && t + threadIdx.x < k) ? a[row * k + t + threadIdx.x] : ($T)0;
        tb[threadIdx.y][threadIdx.x] =
            (col < n && t + threadIdx.y < k) ? b[(t + threadIdx.y) * n + col] : ($T)0;
        __syncthreads();
        for (int p = 0; p < 16; ++p) {
            acc += ta[threadIdx.y][p] * tb[p][threadIdx.x];
        }
        __syncthreads();
    }
    if (row < m && col < n) {
        c[row * n + col] = acc;
    }
}

// meta: C D H W N  T R S K  M P Q  pad_d pad_h pad_w  str_d str_h str_w
extern "C" __global__ void conv_fprop_$S(const $T* in, const $T* f, $T* out, const long long* meta) {
    const long long C = meta[0], D = meta[1], H = meta[2], W = meta[3], N = meta[4];
    const long long T = meta[5], R = meta[6], S = meta[7], K = meta[8];
    const long long M = meta[9], P = meta[10], Q = meta[11];
    const long long pd = meta[12], ph = meta[13], pw = meta[14];
    const long long sd = meta[15], sh = meta[16], sw = meta[17];
    GRID_LOOP(o, K * M * P * Q * N) {
        long long rest = o;
        const long long n = rest % N; rest /= N;
        const long long q = rest % Q; rest /= Q;
        const long long p = rest % P; rest /= P;
        const long long m = rest % M;
        const long long k = rest / M;
        double acc = 0.0;
        for (long long c = 0; c < C; ++c) {
            for (long long t = 0; t < T; ++t) {
                const long long d = m * sd - pd + t;
                if (d < 0 || d >= D) continue;
                for (long long r = 0; r < R; ++r) {
                    const long long h = p * sh - ph + r;
                    if (h < 0 || h >= H) continue;
                    for (long long s = 0; s < S; ++s) {
                        const long long w = q * sw - pw + s;
                        if (w < 0 || w >= W) continue;
                        acc += (double)in[(((c * D + d) * H + h) * W + w) * N + n]
                             * (double)f[(((c * T + t) * R + r) * S + s) * K + k];
                    }
                }
            }
        }
        out[o] = ($T)acc;
    }
}

// Gradient with respect to the input; one thread per input cell.
extern "C" __global__ void conv_bprop_$S(const $T* delta, const $T* f, $T* out, const long long* meta) {
    const long long C = meta[0], D = meta[1], H = meta[2], W = meta[3], N = meta[4];
    const long long T = meta[5], R = meta[6], S = meta[7], K = meta[8];
    const long long M = meta[9], P = meta[10], Q = meta[11];
    const long long pd = meta[12], ph = meta[13], pw = meta[14];
    const long long sd = meta[15], sh = meta[16], sw = meta[17];
    GRID_LOOP(o, C * D * H * W * N) {
        long long rest = o;
        const long long n = rest % N; rest /= N;
        const long long w = rest % W; rest /= W;
        const long long h = rest % H; rest /= H;
        const long long d = rest % D;
        const long long c = rest / D;
        double acc = 0.0;
        for (long long t = 0; t < T; ++t) {
            const long long md = d + pd - t;
            if (md < 0 || md % sd != 0 || md / sd >= M) continue;
            const long long m = md / sd;
            for (long long r = 0; r < R; ++r) {
                const long long ph_ = h + ph - r;
                if (ph_ < 0 || ph_ % sh != 0 || ph_ / sh >= P) continue;
                const long long p = ph_ / sh;
                for (long long s = 0; s < S; ++s) {
                    const long long qw = w + pw - s;
                    if (qw < 0 || qw % sw != 0 || qw / sw >= Q) continue;
                    const long long q = qw / sw;
                    for (long long k = 0; k < K; ++k) {
                        acc += (double)delta[(((k * M + m) * P + p) * Q + q) * N + n]
                             * (double)f[(((c * T + t) * R + r) * S + s) * K + k];
                    }
                }
            }
        }
        out[o] = ($T)acc;
    }
}

// Gradient with respect to the filter; one thread per filter tap.
extern "C" __global__ void conv_update_$S(const $T* delta, const $T* in, $T* out, const long long* meta) {
    const long long C = meta[0], D = meta[1], H = meta[2], W = meta[3], N = meta[4];
    const long long T = meta[5], R = meta[6], S = meta[7], K = meta[8];
    const long long M = meta[9], P = meta[10], Q = meta[11];
    const long long pd = meta[12], ph = meta[13], pw = meta[14];
    const long long sd = meta[15], sh = meta[16], sw = meta[17];
    GRID_LOOP(o, C * T * R * S * K) {
        long long rest = o;
        const long long k = rest % K; rest /= K;
        const long long s = rest % S; rest /= S;
        const long long r = rest % R; rest /= R;
        const long long t = rest % T;
        const long long c = rest / T;
        double acc = 0.0;
        for (long long m = 0; m < M; ++m) {
            const long long d = m * sd - pd + t;
            if (d < 0 || d >= D) continue;
            for (long long p = 0; p < P; ++p) {
                const long long h = p * sh - ph + r;
                if (h < 0 || h >= H) continue;
                for (long long q = 0; q < Q; ++q) {
                    const long long w = q * sw - pw + s;
                    if (w < 0 || w >= W) continue;
                    for (long long n = 0; n < N; ++n) {
                        acc += (double)delta[(((k * M + m) * P + p) * Q + q) * N + n]
                             * (double)in[(((c * D + d) * H + h) * W + w) * N + n];
                    }
                }
            }
        }
        out[o] = ($T)acc;
    }
}

// meta: C D H W N  K M P Q  window[4]  pad[4]  stride[4]  op (0 max, 1 avg)
extern "C" __global__ void pool_fprop_$S(const $T* in, $T* out, long long* argmax, const long long* meta) {
    const long long* x = meta;
    const long long* y = meta + 5;
    const long long* win = meta + 9;
    const long long* pad = meta + 13;
    const long long* str = meta + 17;
    const long long N = x[4];
    const bool is_max = meta[21] == 0;
    GRID_LOOP(o, y[0] * y[1] * y[2] * y[3] * N) {
        long long rest = o;
        const long long n = rest % N; rest /= N;
        long long pos[4];
        for (int a = 3; a >= 0; --a) {
            pos[a] = rest % y[a];
            rest /= y[a];
        }
        long long start[4], len[4];
        long long count = 1;
        for (int a = 0; a < 4; ++a) {
            len[a] = clipped(pos[a], win[a], pad[a], str[a], x[a], &start[a]);
            count *= len[a];
        }
        double result = 0.0;
        long long best = -1;
        double best_v = 0.0;
        for (long long c = start[0]; c < start[0] + len[0]; ++c)
        for (long long d = start[1]; d < start[1] + len[1]; ++d)
        for (long long h = start[2]; h < start[2] + len[2]; ++h)
        for (long long w = start[3]; w < start[3] + len[3]; ++w) {
            const long long cell = ((c * x[1] + d) * x[2] + h) * x[3] + w;
            const double v = (double)in[cell * N + n];
            if (is_max) {
                if (best < 0 || v > best_v) {
                    best = cell;
                    best_v = v;
                }
            } else {
                result += v;
            }
        }
        if (is_max) {
            out[o] = ($T)(best < 0 ? 0.0 : best_v);
            argmax[o] = best;
        } else {
            out[o] = ($T)(count > 0 ? result / (double)count : 0.0);
            argmax[o] = -1;
        }
    }
}

// Gradient of a pooling; one thread per input cell, gathering from every
// output window that covers it.
extern "C" __global__ void pool_bprop_$S(const $T* delta, const long long* argmax, $T* out, const long long* meta) {
    const long long* x = meta;
    const long long* y = meta + 5;
    const long long* win = meta + 9;
    const long long* pad = meta + 13;
    const long long* str = meta + 17;
    const long long N = x[4];
    const bool is_max = meta[21] == 0;
    GRID_LOOP(o, x[0] * x[1] * x[2] * x[3] * N) {
        long long rest = o;
        const long long n = rest % N; rest /= N;
        long long pos[4];
        for (int a = 3; a >= 0; --a) {
            pos[a] = rest % x[a];
            rest /= x[a];
        }
        const long long cell = o / N;
        long long lo[4], hi[4];
        for (int a = 0; a < 4; ++a) {
            window_range(pos[a], win[a], pad[a], str[a], y[a], &lo[a], &hi[a]);
        }
        double acc = 0.0;
        for (long long k = lo[0]; k <= hi[0]; ++k)
        for (long long m = lo[1]; m <= hi[1]; ++m)
        for (long long p = lo[2]; p <= hi[2]; ++p)
        for (long long q = lo[3]; q <= hi[3]; ++q) {
            const long long win_o = (((k * y[1] + m) * y[2] + p) * y[3] + q) * N + n;
            if (is_max) {
                if (argmax[win_o] == cell) acc += (double)delta[win_o];
            } else {
                const long long wpos[4] = {k, m, p, q};
                long long count = 1, start;
                for (int a = 0; a < 4; ++a) {
                    count *= clipped(wpos[a], win[a], pad[a], str[a], x[a], &start);
                }
                if (count > 0) acc += (double)delta[win_o] / (double)count;
            }
        }
        out[o] = ($T)acc;
    }
}
"#;

/// Suffix of the native variant for `dtype`, if there is one.
pub fn native_suffix(dtype: DType) -> Option<&'static str> {
    match dtype {
        DType::F32 => Some("f32"),
        DType::F64 => Some("f64"),
        _ => None,
    }
}

/// Full name of native kernel `base` for `dtype`.
pub fn native_name(base: &str, dtype: DType) -> Option<String> {
    native_suffix(dtype).map(|s| format!("{}_{}", base, s))
}

/// Every function the native module exports.
pub fn native_names() -> Vec<String> {
    [DType::F32, DType::F64]
        .iter()
        .flat_map(|&dt| NATIVE_KERNELS.iter().filter_map(move |k| native_name(k, dt)))
        .collect()
}

/// Source of the native module: the prelude and the library expanded for
/// f32 and f64.
pub fn native_source() -> String {
    let mut source = String::from(PRELUDE);
    for dtype in [DType::F32, DType::F64] {
        if let Some(s) = native_suffix(dtype) {
            source.push_str(&NATIVE_TEMPLATE.replace("$T", dtype.c_type()).replace("$S", s));
        }
    }
    source
}

/// Source of one fused kernel as compiled: prelude plus body.
pub fn fused_source(body: &str) -> String {
    format!("{}\n{}", PRELUDE, body)
}
