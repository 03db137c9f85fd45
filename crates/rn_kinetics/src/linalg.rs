use std::fmt;
use ndarray::{Array1, Array2};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SingularMatrix {
    pub column: usize,
}

impl fmt::Display for SingularMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Matrix is singular (no pivot in column {})", self.column)
    }
}

impl std::error::Error for SingularMatrix {}

/// LU factorization with partial pivoting, `P A = L U`, stored in place.
#[derive(Debug, Clone)]
pub struct LuDecomposition {
    lu: Array2<f64>,
    pivots: Vec<usize>,
}

impl LuDecomposition {
    pub fn factor(mut a: Array2<f64>) -> Result<Self, SingularMatrix> {
        let n = a.nrows();
        assert_eq!(n, a.ncols(), "LU factorization needs a square matrix");
        let mut pivots: Vec<usize> = (0..n).collect();

        for k in 0..n {
            let (p, max) = (k..n)
                .map(|i| (i, a[[i, k]].abs()))
                .fold((k, 0.), |best, x| if x.1 > best.1 { x } else { best });
            if max < f64::MIN_POSITIVE || !max.is_finite() {
                return Err(SingularMatrix { column: k });
            }
            if p != k {
                for j in 0..n {
                    a.swap([k, j], [p, j]);
                }
                pivots.swap(k, p);
            }
            let pivot = a[[k, k]];
            for i in (k + 1)..n {
                let factor = a[[i, k]] / pivot;
                a[[i, k]] = factor;
                if factor == 0. {
                    continue;
                }
                for j in (k + 1)..n {
                    a[[i, j]] -= factor * a[[k, j]];
                }
            }
        }
        Ok(Self { lu: a, pivots })
    }

    pub fn dim(&self) -> usize {
        self.pivots.len()
    }

    /// Solve `A x = b`.
    pub fn solve(&self, b: &Array1<f64>) -> Array1<f64> {
        let n = self.dim();
        let mut x: Array1<f64> = self.pivots.iter().map(|&p| b[p]).collect();
        for i in 0..n {
            let mut s = x[i];
            for j in 0..i {
                s -= self.lu[[i, j]] * x[j];
            }
            x[i] = s;
        }
        for i in (0..n).rev() {
            let mut s = x[i];
            for j in (i + 1)..n {
                s -= self.lu[[i, j]] * x[j];
            }
            x[i] = s / self.lu[[i, i]];
        }
        x
    }
}
