//! Differentiable operations over flat row-major matrices.
//!
//! Every op computes its result eagerly and, when any input requires a
//! gradient, installs a [`BackwardOp`] on the result. Backward rules only
//! accumulate into their inputs; ordering is the driver's job.

use super::tensor::{BackwardOp, Tensor};
use ndarray::Array1;
use std::cell::RefCell;
use std::rc::Rc;

/// Transpose a row-major `rows x cols` matrix.
#[inline]
pub fn transpose(data: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = data[r * cols + c];
        }
    }
    out
}

/// Plain GEMM: C(m x n) = A(m x k) @ B(k x n), all flattened row-major.
pub fn matmul_compute(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut c = vec![0.0f32; m * n];
    for i in 0..m {
        for p in 0..k {
            let a_ip = a[i * k + p];
            if a_ip == 0.0 {
                continue;
            }
            for j in 0..n {
                c[i * n + j] += a_ip * b[p * n + j];
            }
        }
    }
    c
}

type GradCell = Rc<RefCell<Option<Array1<f32>>>>;

fn output_grad(cell: &GradCell) -> Option<Array1<f32>> {
    cell.borrow().clone()
}

/// Linear projection: `y = x @ w^T` where `x` is `rows x d_in` and `w` is
/// stored `d_out x d_in` (one output row per weight row).
pub fn linear(x: &Tensor, w: &Tensor, rows: usize, d_in: usize, d_out: usize) -> Tensor {
    assert_eq!(x.len(), rows * d_in, "linear: input size mismatch");
    assert_eq!(w.len(), d_out * d_in, "linear: weight size mismatch");

    let y = {
        let x_data = x.data();
        let w_data = w.data();
        let w_t = transpose(w_data.as_slice().expect("weight is contiguous"), d_out, d_in);
        matmul_compute(
            x_data.as_slice().expect("input is contiguous"),
            &w_t,
            rows,
            d_in,
            d_out,
        )
    };

    let requires_grad = x.requires_grad() || w.requires_grad();
    let result = Tensor::from_vec(y, requires_grad);
    if requires_grad {
        result.set_backward_op(Rc::new(LinearBackward {
            x: x.clone(),
            w: w.clone(),
            rows,
            d_in,
            d_out,
            out_grad: result.grad_cell(),
        }));
    }
    result
}

struct LinearBackward {
    x: Tensor,
    w: Tensor,
    rows: usize,
    d_in: usize,
    d_out: usize,
    out_grad: GradCell,
}

impl BackwardOp for LinearBackward {
    fn backward(&self) {
        let Some(gy) = output_grad(&self.out_grad) else {
            return;
        };
        let gy_slice = gy.as_slice().expect("gradient is contiguous");

        if self.x.requires_grad() {
            // dX = dY @ W : (rows x d_out) @ (d_out x d_in)
            let w_data = self.w.data();
            let gx = matmul_compute(
                gy_slice,
                w_data.as_slice().expect("weight is contiguous"),
                self.rows,
                self.d_out,
                self.d_in,
            );
            drop(w_data);
            self.x.accumulate_grad(Array1::from(gx));
        }

        if self.w.requires_grad() {
            // dW = dY^T @ X : (d_out x rows) @ (rows x d_in)
            let gy_t = transpose(gy_slice, self.rows, self.d_out);
            let x_data = self.x.data();
            let gw = matmul_compute(
                &gy_t,
                x_data.as_slice().expect("input is contiguous"),
                self.d_out,
                self.rows,
                self.d_in,
            );
            drop(x_data);
            self.w.accumulate_grad(Array1::from(gw));
        }
    }

    fn inputs(&self) -> Vec<Tensor> {
        vec![self.x.clone(), self.w.clone()]
    }
}

/// Elementwise sum of two equally sized tensors.
pub fn add(a: &Tensor, b: &Tensor) -> Tensor {
    assert_eq!(a.len(), b.len(), "add: size mismatch");
    let data = &*a.data() + &*b.data();
    let requires_grad = a.requires_grad() || b.requires_grad();
    let result = Tensor::new(data, requires_grad);
    if requires_grad {
        result.set_backward_op(Rc::new(AddBackward {
            a: a.clone(),
            b: b.clone(),
            out_grad: result.grad_cell(),
        }));
    }
    result
}

struct AddBackward {
    a: Tensor,
    b: Tensor,
    out_grad: GradCell,
}

impl BackwardOp for AddBackward {
    fn backward(&self) {
        let Some(g) = output_grad(&self.out_grad) else {
            return;
        };
        if self.a.requires_grad() {
            self.a.accumulate_grad(g.clone());
        }
        if self.b.requires_grad() {
            self.b.accumulate_grad(g);
        }
    }

    fn inputs(&self) -> Vec<Tensor> {
        vec![self.a.clone(), self.b.clone()]
    }
}

/// Multiply every element by a constant.
pub fn scale(a: &Tensor, factor: f32) -> Tensor {
    let data = a.data().mapv(|v| v * factor);
    let requires_grad = a.requires_grad();
    let result = Tensor::new(data, requires_grad);
    if requires_grad {
        result.set_backward_op(Rc::new(ScaleBackward {
            a: a.clone(),
            factor,
            out_grad: result.grad_cell(),
        }));
    }
    result
}

struct ScaleBackward {
    a: Tensor,
    factor: f32,
    out_grad: GradCell,
}

impl BackwardOp for ScaleBackward {
    fn backward(&self) {
        let Some(g) = output_grad(&self.out_grad) else {
            return;
        };
        self.a.accumulate_grad(g.mapv(|v| v * self.factor));
    }

    fn inputs(&self) -> Vec<Tensor> {
        vec![self.a.clone()]
    }
}

/// Rectified linear unit.
pub fn relu(a: &Tensor) -> Tensor {
    let data = a.data().mapv(|v| v.max(0.0));
    let requires_grad = a.requires_grad();
    let result = Tensor::new(data, requires_grad);
    if requires_grad {
        let mask: Vec<f32> = a.data().iter().map(|&v| if v > 0.0 { 1.0 } else { 0.0 }).collect();
        result.set_backward_op(Rc::new(ReluBackward {
            a: a.clone(),
            mask,
            out_grad: result.grad_cell(),
        }));
    }
    result
}

struct ReluBackward {
    a: Tensor,
    mask: Vec<f32>,
    out_grad: GradCell,
}

impl BackwardOp for ReluBackward {
    fn backward(&self) {
        let Some(g) = output_grad(&self.out_grad) else {
            return;
        };
        let gated: Vec<f32> = g.iter().zip(self.mask.iter()).map(|(&gi, &mi)| gi * mi).collect();
        self.a.accumulate_grad(Array1::from(gated));
    }

    fn inputs(&self) -> Vec<Tensor> {
        vec![self.a.clone()]
    }
}

/// Causal smoothing over a `rows x dim` matrix of per-position states:
/// row 0 passes through, row t becomes the mean of rows t and t-1. Keeps
/// every position's state dependent on its predecessors without growing the
/// parameter count.
pub fn causal_mix(x: &Tensor, rows: usize, dim: usize) -> Tensor {
    assert_eq!(x.len(), rows * dim, "causal_mix: size mismatch");
    let mut data = vec![0.0f32; rows * dim];
    {
        let x_data = x.data();
        let xs = x_data.as_slice().expect("input is contiguous");
        data[..dim].copy_from_slice(&xs[..dim]);
        for t in 1..rows {
            for d in 0..dim {
                data[t * dim + d] = 0.5 * (xs[t * dim + d] + xs[(t - 1) * dim + d]);
            }
        }
    }
    let requires_grad = x.requires_grad();
    let result = Tensor::from_vec(data, requires_grad);
    if requires_grad {
        result.set_backward_op(Rc::new(CausalMixBackward {
            x: x.clone(),
            rows,
            dim,
            out_grad: result.grad_cell(),
        }));
    }
    result
}

struct CausalMixBackward {
    x: Tensor,
    rows: usize,
    dim: usize,
    out_grad: GradCell,
}

impl BackwardOp for CausalMixBackward {
    fn backward(&self) {
        let Some(g) = output_grad(&self.out_grad) else {
            return;
        };
        let gs = g.as_slice().expect("gradient is contiguous");
        let mut gx = vec![0.0f32; self.rows * self.dim];
        for d in 0..self.dim {
            gx[d] = gs[d];
        }
        for t in 1..self.rows {
            for d in 0..self.dim {
                gx[t * self.dim + d] += 0.5 * gs[t * self.dim + d];
                gx[(t - 1) * self.dim + d] += 0.5 * gs[t * self.dim + d];
            }
        }
        self.x.accumulate_grad(Array1::from(gx));
    }

    fn inputs(&self) -> Vec<Tensor> {
        vec![self.x.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::backward;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_transpose_2x3() {
        let t = transpose(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3);
        assert_eq!(t, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_matmul_compute_known() {
        let c = matmul_compute(&[1.0, 2.0, 3.0, 4.0], &[5.0, 6.0, 7.0, 8.0], 2, 2, 2);
        assert_eq!(c, vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_linear_forward() {
        // x: 1x2 = [1, 2]; w: 3x2 rows [1,0], [0,1], [1,1]
        let x = Tensor::from_vec(vec![1.0, 2.0], false);
        let w = Tensor::from_vec(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], false);
        let y = linear(&x, &w, 1, 2, 3);
        assert_eq!(y.data().to_vec(), vec![1.0, 2.0, 3.0]);
        assert!(!y.requires_grad());
    }

    #[test]
    fn test_linear_backward_weight_grad() {
        let x = Tensor::from_vec(vec![1.0, 2.0], false);
        let w = Tensor::from_vec(vec![0.5, 0.5, 0.5, 0.5], true);
        let y = linear(&x, &w, 1, 2, 2);
        backward(&y);
        // dW[o][i] = gy[o] * x[i], gy seeded with ones
        let gw = w.grad().unwrap();
        assert_eq!(gw.to_vec(), vec![1.0, 2.0, 1.0, 2.0]);
    }

    #[test]
    fn test_linear_backward_input_grad() {
        let x = Tensor::from_vec(vec![1.0, 2.0], true);
        let w = Tensor::from_vec(vec![1.0, 0.0, 0.0, 1.0], false);
        let y = linear(&x, &w, 1, 2, 2);
        backward(&y);
        // Identity weight: dX = gy @ W = ones
        assert_eq!(x.grad().unwrap().to_vec(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_shared_input_grads_accumulate_once_per_branch() {
        // y = (x @ I) + (x @ I): dX must be exactly 2, not 3 as the naive
        // recursive backward would produce on a fan-out.
        let x = Tensor::from_vec(vec![1.0, 1.0], true);
        let w = Tensor::from_vec(vec![1.0, 0.0, 0.0, 1.0], false);
        let a = linear(&x, &w, 1, 2, 2);
        let b = linear(&x, &w, 1, 2, 2);
        let y = add(&a, &b);
        backward(&y);
        assert_eq!(x.grad().unwrap().to_vec(), vec![2.0, 2.0]);
    }

    #[test]
    fn test_fan_out_upstream_not_double_counted() {
        // z = x @ I; y = z + z. Upstream of the fan-out point, x's gradient
        // must be 2 per element, exactly once.
        let x = Tensor::from_vec(vec![3.0], true);
        let w = Tensor::from_vec(vec![1.0], false);
        let z = linear(&x, &w, 1, 1, 1);
        let y = add(&z, &z);
        backward(&y);
        assert_eq!(x.grad().unwrap().to_vec(), vec![2.0]);
    }

    #[test]
    fn test_scale_backward() {
        let x = Tensor::from_vec(vec![1.0, 2.0], true);
        let y = scale(&x, 3.0);
        backward(&y);
        assert_eq!(x.grad().unwrap().to_vec(), vec![3.0, 3.0]);
    }

    #[test]
    fn test_relu_forward_backward() {
        let x = Tensor::from_vec(vec![-1.0, 2.0], true);
        let y = relu(&x);
        assert_eq!(y.data().to_vec(), vec![0.0, 2.0]);
        backward(&y);
        assert_eq!(x.grad().unwrap().to_vec(), vec![0.0, 1.0]);
    }

    #[test]
    fn test_causal_mix_forward() {
        // rows=3, dim=1: [1, 3, 5] -> [1, 2, 4]
        let x = Tensor::from_vec(vec![1.0, 3.0, 5.0], false);
        let y = causal_mix(&x, 3, 1);
        assert_eq!(y.data().to_vec(), vec![1.0, 2.0, 4.0]);
    }

    #[test]
    fn test_causal_mix_backward() {
        let x = Tensor::from_vec(vec![1.0, 3.0, 5.0], true);
        let y = causal_mix(&x, 3, 1);
        backward(&y);
        // dx0 = 1 + 0.5, dx1 = 0.5 + 0.5, dx2 = 0.5
        let g = x.grad().unwrap();
        assert_abs_diff_eq!(g[0], 1.5, epsilon = 1e-6);
        assert_abs_diff_eq!(g[1], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(g[2], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_lora_shaped_chain_grads() {
        // delta = scale * ((x @ A^T) @ B^T) with B zero: delta is zero but
        // dA stays zero and dB is nonzero, the standard LoRA warm start.
        let x = Tensor::from_vec(vec![1.0, 2.0], false);
        let a = Tensor::from_vec(vec![0.1, 0.2], true); // 1x2
        let b = Tensor::zeros(2, true); // 2x1
        let h = linear(&x, &a, 1, 2, 1);
        let d = linear(&h, &b, 1, 1, 2);
        let y = scale(&d, 2.0);
        backward(&y);
        let ga = a.grad().unwrap();
        let gb = b.grad().unwrap();
        assert!(ga.iter().all(|&g| g == 0.0), "dA through zero B must vanish");
        assert!(gb.iter().any(|&g| g != 0.0), "dB must be driven by A @ x");
    }
}
