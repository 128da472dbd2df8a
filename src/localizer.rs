use nalgebra::{DMatrix, SymmetricEigen};

/** classical_scaling()
 * @brief   Recovers point coordinates from a matrix of pairwise distances
 * @param   An N x N matrix whose entries are (signed) distances; only their
 *          squares are used, so an antisymmetric matrix is fine
 * @param   Number of output dimensions
 * @returns An N x dims matrix, one row per point, centred on the origin
 *
 * The squared distances are double centred, B = -1/2 J D² J, and the top
 * `dims` eigenpairs of B give the coordinates. Eigenvalues that come out
 * negative (distances that no point set in `dims` dimensions reproduces)
 * contribute a zero column.
 */
pub fn classical_scaling(distances: &DMatrix<f64>, dims: usize) -> DMatrix<f64> {
    let n = distances.nrows().min(distances.ncols());
    let mut coords = DMatrix::<f64>::zeros(n, dims);
    if n == 0 {
        return coords;
    }

    let squared = DMatrix::from_fn(n, n, |i, j| {
        let d = distances[(i, j)];
        d * d
    });
    let centring = DMatrix::identity(n, n) - DMatrix::from_element(n, n, 1.0 / n as f64);
    let gram = &centring * squared * &centring * -0.5;

    let eigen = SymmetricEigen::new(gram);
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

    for (k, &idx) in order.iter().take(dims).enumerate() {
        let lambda = eigen.eigenvalues[idx];
        if lambda <= 0.0 {
            continue;
        }
        let scale = lambda.sqrt();
        for i in 0..n {
            coords[(i, k)] = eigen.eigenvectors[(i, idx)] * scale;
        }
    }
    coords
}

/** pairwise_distances()
 * @brief   Euclidean distances between the rows of a coordinate matrix
 * @returns A symmetric N x N matrix with a zero diagonal
 */
pub fn pairwise_distances(coords: &DMatrix<f64>) -> DMatrix<f64> {
    let n = coords.nrows();
    DMatrix::from_fn(n, n, |i, j| (coords.row(i) - coords.row(j)).norm())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> DMatrix<f64> {
        DMatrix::from_row_slice(3, 2, &[0.0, 0.0, 3.0, 0.0, 0.0, 4.0])
    }

    fn assert_close(a: &DMatrix<f64>, b: &DMatrix<f64>, tol: f64) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < tol, "{} vs {}\n{}\n{}", x, y, a, b);
        }
    }

    #[test]
    fn round_trip_reproduces_distances() {
        let distances = pairwise_distances(&triangle());
        assert!((distances[(1, 2)] - 5.0).abs() < 1e-12);

        let coords = classical_scaling(&distances, 2);
        assert_eq!(coords.shape(), (3, 2));
        assert_close(&pairwise_distances(&coords), &distances, 1e-9);
    }

    #[test]
    fn signs_of_the_input_do_not_matter() {
        let distances = pairwise_distances(&triangle());
        let antisymmetric = DMatrix::from_fn(3, 3, |i, j| {
            if i > j {
                -distances[(i, j)]
            } else {
                distances[(i, j)]
            }
        });
        let coords = classical_scaling(&antisymmetric, 2);
        assert_close(&pairwise_distances(&coords), &distances, 1e-9);
    }

    #[test]
    fn output_is_centred() {
        let coords = classical_scaling(&pairwise_distances(&triangle()), 2);
        for k in 0..2 {
            assert!(coords.column(k).sum().abs() < 1e-9);
        }
    }

    #[test]
    fn collinear_points_need_one_dimension() {
        let line = DMatrix::from_row_slice(4, 1, &[0.0, 1.0, 2.5, 4.0]);
        let distances = pairwise_distances(&line);
        let coords = classical_scaling(&distances, 3);
        assert_eq!(coords.shape(), (4, 3));
        assert_close(&pairwise_distances(&coords), &distances, 1e-9);
        for i in 0..4 {
            assert!(coords[(i, 1)].abs() < 1e-6);
            assert!(coords[(i, 2)].abs() < 1e-6);
        }
    }

    #[test]
    fn degenerate_sizes() {
        assert_eq!(classical_scaling(&DMatrix::zeros(0, 0), 2).shape(), (0, 2));
        let single = classical_scaling(&DMatrix::zeros(1, 1), 2);
        assert_eq!(single.shape(), (1, 2));
        assert!(single.iter().all(|v| *v == 0.0));
    }
}
