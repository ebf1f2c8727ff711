//! Block-sparse storage for the global contact operator.
//!
//! The operator of the assembled complementarity problem is an `N x N` matrix
//! partitioned into small dense blocks, one block row/column per interaction.
//! Only blocks of interacting pairs are stored; everything else is absent
//! rather than zero, so multiplies skip them entirely.

use crate::Error;

/// A single dense block of the global operator.
///
/// Diagonal blocks are `d x d` where `d` is the nonsmooth law size of the
/// owning interaction; coupling blocks are `d_i x d_j`.
pub type Block = na::DMatrix<f64>;

/// Integer tag discriminating operator storage representations.
///
/// These tags appear in problem dumps and configuration records, so their
/// numeric values are stable.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StorageKind {
    Dense = 0,
    BlockSparse = 1,
    Csc = 2,
}

impl StorageKind {
    pub fn tag(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for StorageKind {
    type Error = Error;
    fn try_from(tag: i32) -> Result<Self, Error> {
        match tag {
            0 => Ok(StorageKind::Dense),
            1 => Ok(StorageKind::BlockSparse),
            2 => Ok(StorageKind::Csc),
            t => Err(Error::UnknownStorageTag(t)),
        }
    }
}

/// Matrix stored as a sparse grid of dense blocks.
///
/// Rows and columns are partitioned independently. Each block row keeps an
/// ordered list of `(block_col, Block)` pairs; absent entries contribute
/// nothing to products.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockSparseMatrix {
    /// Cumulative row partition; `row_offsets[i]..row_offsets[i+1]` spans block row `i`.
    row_offsets: Vec<usize>,
    /// Cumulative column partition.
    col_offsets: Vec<usize>,
    /// Per block row, the stored blocks sorted by block column.
    rows: Vec<Vec<(usize, Block)>>,
}

fn offsets(dims: &[usize]) -> Vec<usize> {
    let mut offs = Vec::with_capacity(dims.len() + 1);
    let mut acc = 0;
    offs.push(0);
    for &d in dims {
        acc += d;
        offs.push(acc);
    }
    offs
}

impl BlockSparseMatrix {
    /// Creates an empty matrix with the given block row and column dimensions.
    pub fn new(row_dims: &[usize], col_dims: &[usize]) -> Self {
        BlockSparseMatrix {
            row_offsets: offsets(row_dims),
            col_offsets: offsets(col_dims),
            rows: vec![Vec::new(); row_dims.len()],
        }
    }

    /// Creates an empty square matrix with identical row and column partitions.
    pub fn square(dims: &[usize]) -> Self {
        Self::new(dims, dims)
    }

    pub fn num_rows(&self) -> usize {
        *self.row_offsets.last().unwrap_or(&0)
    }

    pub fn num_cols(&self) -> usize {
        *self.col_offsets.last().unwrap_or(&0)
    }

    pub fn num_block_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn num_block_cols(&self) -> usize {
        self.col_offsets.len() - 1
    }

    pub fn row_offsets(&self) -> &[usize] {
        &self.row_offsets
    }

    pub fn col_offsets(&self) -> &[usize] {
        &self.col_offsets
    }

    pub fn block_row_dim(&self, i: usize) -> usize {
        self.row_offsets[i + 1] - self.row_offsets[i]
    }

    pub fn block_col_dim(&self, j: usize) -> usize {
        self.col_offsets[j + 1] - self.col_offsets[j]
    }

    /// True if the row and column partitions coincide.
    pub fn is_square_partition(&self) -> bool {
        self.row_offsets == self.col_offsets
    }

    /// The stored block at `(i, j)`, if any.
    pub fn block(&self, i: usize, j: usize) -> Option<&Block> {
        self.rows[i]
            .binary_search_by_key(&j, |&(col, _)| col)
            .ok()
            .map(|pos| &self.rows[i][pos].1)
    }

    /// The block at `(i, j)`, inserted as zero if absent.
    pub fn block_mut_or_insert(&mut self, i: usize, j: usize) -> &mut Block {
        let (ri, ci) = (self.block_row_dim(i), self.block_col_dim(j));
        let row = &mut self.rows[i];
        let pos = match row.binary_search_by_key(&j, |&(col, _)| col) {
            Ok(pos) => pos,
            Err(pos) => {
                row.insert(pos, (j, Block::zeros(ri, ci)));
                pos
            }
        };
        &mut row[pos].1
    }

    /// Stores `block` at `(i, j)`, replacing any previous entry.
    pub fn set_block(&mut self, i: usize, j: usize, block: Block) -> Result<(), Error> {
        if block.nrows() != self.block_row_dim(i) || block.ncols() != self.block_col_dim(j) {
            return Err(Error::SizeMismatch);
        }
        *self.block_mut_or_insert(i, j) = block;
        Ok(())
    }

    /// Zeroes all stored blocks, keeping the sparsity pattern.
    pub fn zero(&mut self) {
        for row in &mut self.rows {
            for (_, block) in row.iter_mut() {
                block.fill(0.0);
            }
        }
    }

    /// Scales all stored blocks by `factor`.
    pub fn scale(&mut self, factor: f64) {
        for row in &mut self.rows {
            for (_, block) in row.iter_mut() {
                *block *= factor;
            }
        }
    }

    /// Iterates over stored blocks as `(block_row, block_col, block)`.
    pub fn iter_blocks(&self) -> impl Iterator<Item = (usize, usize, &Block)> {
        self.rows
            .iter()
            .enumerate()
            .flat_map(|(i, row)| row.iter().map(move |(j, b)| (i, *j, b)))
    }

    /// Expands into a flat dense matrix.
    pub fn to_dense(&self) -> na::DMatrix<f64> {
        let mut out = na::DMatrix::zeros(self.num_rows(), self.num_cols());
        for (i, j, block) in self.iter_blocks() {
            out.view_mut(
                (self.row_offsets[i], self.col_offsets[j]),
                (block.nrows(), block.ncols()),
            )
            .copy_from(block);
        }
        out
    }

    /// Builds a block-sparse matrix from a dense one under the given partitions.
    ///
    /// Blocks that are identically zero are left out of the pattern.
    pub fn from_dense(
        m: &na::DMatrix<f64>,
        row_dims: &[usize],
        col_dims: &[usize],
    ) -> Result<Self, Error> {
        let mut out = Self::new(row_dims, col_dims);
        if out.num_rows() != m.nrows() || out.num_cols() != m.ncols() {
            return Err(Error::SizeMismatch);
        }
        for i in 0..out.num_block_rows() {
            for j in 0..out.num_block_cols() {
                let view = m.view(
                    (out.row_offsets[i], out.col_offsets[j]),
                    (out.block_row_dim(i), out.block_col_dim(j)),
                );
                if view.iter().any(|&x| x != 0.0) {
                    out.rows[i].push((j, view.into_owned()));
                }
            }
        }
        Ok(out)
    }

    /// Computes `y = A x`.
    pub fn mul_vector(&self, x: &[f64], y: &mut [f64]) -> Result<(), Error> {
        if x.len() != self.num_cols() || y.len() != self.num_rows() {
            return Err(Error::SizeMismatch);
        }
        y.fill(0.0);
        for (i, j, block) in self.iter_blocks() {
            let xs = &x[self.col_offsets[j]..self.col_offsets[j + 1]];
            let ys = &mut y[self.row_offsets[i]..self.row_offsets[i + 1]];
            let xv = na::DVectorView::from(xs);
            let mut yv = na::DVectorViewMut::from(ys);
            yv.gemv(1.0, block, &xv, 1.0);
        }
        Ok(())
    }

    /// Accumulates the off-diagonal part of block row `i` times `x` into `acc`:
    /// `acc += sum_{j != i} A_ij x_j`.
    ///
    /// Used by the block Gauss-Seidel sweep to form local right-hand sides.
    pub fn row_offdiag_mul(&self, i: usize, x: &[f64], acc: &mut [f64]) -> Result<(), Error> {
        if x.len() != self.num_cols() || acc.len() != self.block_row_dim(i) {
            return Err(Error::SizeMismatch);
        }
        for (j, block) in &self.rows[i] {
            if *j == i {
                continue;
            }
            let xs = &x[self.col_offsets[*j]..self.col_offsets[*j + 1]];
            let xv = na::DVectorView::from(xs);
            let mut av = na::DVectorViewMut::from(&mut *acc);
            av.gemv(1.0, block, &xv, 1.0);
        }
        Ok(())
    }
}

/// Global operator of a complementarity problem, in one of the supported
/// storage representations.
///
/// Every operation dispatches exhaustively on the variant; adding a new
/// storage kind requires updating each operation site.
#[derive(Clone, Debug, PartialEq)]
pub enum Operator {
    Dense(na::DMatrix<f64>),
    BlockSparse(BlockSparseMatrix),
    Csc(sprs::CsMat<f64>),
}

impl Operator {
    pub fn kind(&self) -> StorageKind {
        match self {
            Operator::Dense(_) => StorageKind::Dense,
            Operator::BlockSparse(_) => StorageKind::BlockSparse,
            Operator::Csc(_) => StorageKind::Csc,
        }
    }

    pub fn num_rows(&self) -> usize {
        match self {
            Operator::Dense(m) => m.nrows(),
            Operator::BlockSparse(m) => m.num_rows(),
            Operator::Csc(m) => m.rows(),
        }
    }

    pub fn num_cols(&self) -> usize {
        match self {
            Operator::Dense(m) => m.ncols(),
            Operator::BlockSparse(m) => m.num_cols(),
            Operator::Csc(m) => m.cols(),
        }
    }

    pub fn is_square(&self) -> bool {
        self.num_rows() == self.num_cols()
    }

    /// Computes `y = A x`.
    pub fn mul_vector(&self, x: &[f64], y: &mut [f64]) -> Result<(), Error> {
        if x.len() != self.num_cols() || y.len() != self.num_rows() {
            return Err(Error::SizeMismatch);
        }
        match self {
            Operator::Dense(m) => {
                let xv = na::DVectorView::from(x);
                let mut yv = na::DVectorViewMut::from(y);
                yv.gemv(1.0, m, &xv, 0.0);
                Ok(())
            }
            Operator::BlockSparse(m) => m.mul_vector(x, y),
            Operator::Csc(m) => {
                y.fill(0.0);
                match m.storage() {
                    sprs::CompressedStorage::CSC => {
                        sprs::prod::mul_acc_mat_vec_csc(m.view(), x, y);
                    }
                    sprs::CompressedStorage::CSR => {
                        sprs::prod::mul_acc_mat_vec_csr(m.view(), x, y);
                    }
                }
                Ok(())
            }
        }
    }

    /// Expands into a flat dense matrix.
    pub fn to_dense(&self) -> na::DMatrix<f64> {
        match self {
            Operator::Dense(m) => m.clone(),
            Operator::BlockSparse(m) => m.to_dense(),
            Operator::Csc(m) => {
                let mut out = na::DMatrix::zeros(m.rows(), m.cols());
                for (&val, (i, j)) in m.iter() {
                    out[(i, j)] = val;
                }
                out
            }
        }
    }
}

/// Computes `C = alpha * A * B + beta * C`.
///
/// Operands may independently be dense or block-sparse. For block-sparse
/// operands the product is accumulated block by block over the stored
/// sparsity patterns; block partitions of multiplied operands must match
/// exactly, anything else is a configuration error. CSC operators are a
/// boundary representation and do not participate in products.
pub fn gemm(
    alpha: f64,
    a: &Operator,
    b: &Operator,
    beta: f64,
    c: &mut Operator,
) -> Result<(), Error> {
    if a.num_cols() != b.num_rows() || c.num_rows() != a.num_rows() || c.num_cols() != b.num_cols()
    {
        return Err(Error::SizeMismatch);
    }
    match (a, b, c) {
        (Operator::Dense(a), Operator::Dense(b), Operator::Dense(c)) => {
            c.gemm(alpha, a, b, beta);
            Ok(())
        }
        (Operator::BlockSparse(a), Operator::Dense(b), Operator::Dense(c)) => {
            *c *= beta;
            for (i, k, ablk) in a.iter_blocks() {
                let bview = b.view(
                    (a.col_offsets()[k], 0),
                    (a.block_col_dim(k), b.ncols()),
                );
                let mut cview = c.view_mut(
                    (a.row_offsets()[i], 0),
                    (a.block_row_dim(i), b.ncols()),
                );
                cview.gemm(alpha, ablk, &bview, 1.0);
            }
            Ok(())
        }
        (Operator::Dense(a), Operator::BlockSparse(b), Operator::Dense(c)) => {
            *c *= beta;
            for (k, j, bblk) in b.iter_blocks() {
                let aview = a.view(
                    (0, b.row_offsets()[k]),
                    (a.nrows(), b.block_row_dim(k)),
                );
                let mut cview = c.view_mut(
                    (0, b.col_offsets()[j]),
                    (a.nrows(), b.block_col_dim(j)),
                );
                cview.gemm(alpha, &aview, bblk, 1.0);
            }
            Ok(())
        }
        (Operator::BlockSparse(a), Operator::BlockSparse(b), Operator::Dense(c)) => {
            if a.col_offsets() != b.row_offsets() {
                return Err(Error::BlockPartitionMismatch {
                    lhs: a.col_offsets().to_vec(),
                    rhs: b.row_offsets().to_vec(),
                });
            }
            *c *= beta;
            for (i, k, ablk) in a.iter_blocks() {
                for (j, bblk) in &b.rows[k] {
                    let mut cview = c.view_mut(
                        (a.row_offsets()[i], b.col_offsets()[*j]),
                        (ablk.nrows(), bblk.ncols()),
                    );
                    cview.gemm(alpha, ablk, bblk, 1.0);
                }
            }
            Ok(())
        }
        (Operator::BlockSparse(a), Operator::BlockSparse(b), Operator::BlockSparse(c)) => {
            if a.col_offsets() != b.row_offsets() {
                return Err(Error::BlockPartitionMismatch {
                    lhs: a.col_offsets().to_vec(),
                    rhs: b.row_offsets().to_vec(),
                });
            }
            if c.row_offsets() != a.row_offsets() || c.col_offsets() != b.col_offsets() {
                return Err(Error::BlockPartitionMismatch {
                    lhs: c.row_offsets().to_vec(),
                    rhs: a.row_offsets().to_vec(),
                });
            }
            c.scale(beta);
            // Two passes keep the borrow checker happy: gather the products,
            // then accumulate into c.
            let mut products: Vec<(usize, usize, Block)> = Vec::new();
            for (i, k, ablk) in a.iter_blocks() {
                for (j, bblk) in &b.rows[k] {
                    products.push((i, *j, ablk * bblk));
                }
            }
            for (i, j, prod) in products {
                let cblk = c.block_mut_or_insert(i, j);
                cblk.zip_apply(&prod, |c, p| *c += alpha * p);
            }
            Ok(())
        }
        (a, b, c) => Err(Error::UnsupportedOperands {
            op: "gemm",
            a: a.kind(),
            b: b.kind(),
            c: c.kind(),
        }),
    }
}
