//! Plain-text dump format for matrices and problem records.
//!
//! Values are written with the shortest decimal representation that parses
//! back to the identical bit pattern, so a write/read round trip is exact.
//! The matrix format is a `nrows ncols` dimension header followed by the
//! entries in row-major order; the "no-dimension" variant omits the header
//! for embedding in records that carry the size elsewhere.

use std::io::{BufRead, Write};

use crate::lcp::Problem;
use crate::sbm::Operator;
use crate::Error;

/// Writes `m` with a dimension header.
pub fn write_dense<W: Write>(out: &mut W, m: &na::DMatrix<f64>) -> Result<(), Error> {
    writeln!(out, "{} {}", m.nrows(), m.ncols())?;
    write_dense_raw(out, m)
}

/// Writes the entries of `m` in row-major order, no header.
pub fn write_dense_raw<W: Write>(out: &mut W, m: &na::DMatrix<f64>) -> Result<(), Error> {
    for i in 0..m.nrows() {
        for j in 0..m.ncols() {
            if j > 0 {
                write!(out, " ")?;
            }
            write!(out, "{}", m[(i, j)])?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Reads a matrix written by [`write_dense`].
pub fn read_dense<R: BufRead>(input: &mut R) -> Result<na::DMatrix<f64>, Error> {
    let mut tokens = Tokens::new(input)?;
    let nrows = tokens.next_usize("row count")?;
    let ncols = tokens.next_usize("column count")?;
    read_entries(&mut tokens, nrows, ncols)
}

/// Reads a headerless matrix of known dimensions, as written by
/// [`write_dense_raw`].
pub fn read_dense_raw<R: BufRead>(
    input: &mut R,
    nrows: usize,
    ncols: usize,
) -> Result<na::DMatrix<f64>, Error> {
    let mut tokens = Tokens::new(input)?;
    read_entries(&mut tokens, nrows, ncols)
}

/// Writes a problem record: size, the operator expanded to dense, then `q`.
pub fn write_problem<W: Write>(out: &mut W, problem: &Problem) -> Result<(), Error> {
    writeln!(out, "{}", problem.size())?;
    write_dense_raw(out, &problem.m.to_dense())?;
    for (i, qi) in problem.q.iter().enumerate() {
        if i > 0 {
            write!(out, " ")?;
        }
        write!(out, "{}", qi)?;
    }
    writeln!(out)?;
    Ok(())
}

/// Reads a problem record written by [`write_problem`]. The operator comes
/// back in dense storage.
pub fn read_problem<R: BufRead>(input: &mut R) -> Result<Problem, Error> {
    let mut tokens = Tokens::new(input)?;
    let n = tokens.next_usize("problem size")?;
    let m = read_entries(&mut tokens, n, n)?;
    let mut q = Vec::with_capacity(n);
    for _ in 0..n {
        q.push(tokens.next_f64("q entry")?);
    }
    Problem::new(Operator::Dense(m), q)
}

fn read_entries(
    tokens: &mut Tokens,
    nrows: usize,
    ncols: usize,
) -> Result<na::DMatrix<f64>, Error> {
    let mut data = Vec::with_capacity(nrows * ncols);
    for _ in 0..nrows * ncols {
        data.push(tokens.next_f64("matrix entry")?);
    }
    Ok(na::DMatrix::from_row_slice(nrows, ncols, &data))
}

/// Whitespace-separated token stream over the whole input.
struct Tokens {
    tokens: Vec<String>,
    pos: usize,
}

impl Tokens {
    fn new<R: BufRead>(input: &mut R) -> Result<Self, Error> {
        let mut text = String::new();
        input.read_to_string(&mut text)?;
        Ok(Tokens {
            tokens: text.split_whitespace().map(str::to_owned).collect(),
            pos: 0,
        })
    }

    fn next(&mut self, what: &str) -> Result<&str, Error> {
        let tok = self
            .tokens
            .get(self.pos)
            .ok_or_else(|| Error::MatrixParse(format!("unexpected end of input, expected {}", what)))?;
        self.pos += 1;
        Ok(tok)
    }

    fn next_usize(&mut self, what: &str) -> Result<usize, Error> {
        let tok = self.next(what)?;
        tok.parse()
            .map_err(|_| Error::MatrixParse(format!("bad {}: {:?}", what, tok)))
    }

    fn next_f64(&mut self, what: &str) -> Result<f64, Error> {
        let tok = self.next(what)?;
        tok.parse()
            .map_err(|_| Error::MatrixParse(format!("bad {}: {:?}", what, tok)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    #[test]
    fn matrix_round_trip_is_exact() {
        let mut rng = StdRng::seed_from_u64(11);
        let m = na::DMatrix::from_fn(4, 3, |_, _| (rng.gen::<f64>() - 0.5) * 1e3);

        let mut buf = Vec::new();
        write_dense(&mut buf, &m).unwrap();
        let back = read_dense(&mut buf.as_slice()).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn awkward_values_survive() {
        let m = na::DMatrix::from_row_slice(
            1,
            4,
            &[0.1 + 0.2, -1e-17, f64::MIN_POSITIVE, 3.0],
        );
        let mut buf = Vec::new();
        write_dense(&mut buf, &m).unwrap();
        let back = read_dense(&mut buf.as_slice()).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn headerless_mode() {
        let m = na::DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let mut buf = Vec::new();
        write_dense_raw(&mut buf, &m).unwrap();
        assert!(!String::from_utf8_lossy(&buf).starts_with("2 2"));
        let back = read_dense_raw(&mut buf.as_slice(), 2, 2).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let text = b"2 2\n1.0 2.0 3.0";
        let err = read_dense(&mut &text[..]).unwrap_err();
        assert!(matches!(err, Error::MatrixParse(_)));
    }

    #[test]
    fn garbage_token_is_rejected() {
        let text = b"2 2\n1.0 oops 3.0 4.0";
        let err = read_dense(&mut &text[..]).unwrap_err();
        assert!(matches!(err, Error::MatrixParse(_)));
    }

    #[test]
    fn problem_round_trip() {
        let m = na::DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, 2.0]);
        let problem = Problem::new(Operator::Dense(m), vec![-5.0, -6.0]).unwrap();

        let mut buf = Vec::new();
        write_problem(&mut buf, &problem).unwrap();
        let back = read_problem(&mut buf.as_slice()).unwrap();
        assert_eq!(back.q, problem.q);
        assert_eq!(back.m.to_dense(), problem.m.to_dense());
    }
}
