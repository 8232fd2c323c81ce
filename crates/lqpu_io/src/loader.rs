use crate::{DESCR, MAGIC};
use anyhow::{Context, Result, anyhow, bail, ensure};
use nom::IResult;
use nom::branch::alt;
use nom::bytes::complete::{tag, take, take_while};
use nom::character::complete::{char, digit1, multispace0};
use nom::combinator::{map, map_res, opt, value};
use nom::multi::separated_list0;
use nom::number::complete::{le_u8, le_u16, le_u32};
use nom::sequence::{delimited, pair, preceded, separated_pair, terminated, tuple};
use std::fs;
use std::path::Path;

/// A 2-D `u32` array read from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpyArray {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<u32>,
}

impl NpyArray {
    /// Row `r` as a slice.
    pub fn row(&self, r: usize) -> &[u32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Value<'a> {
    Str(&'a str),
    Bool(bool),
    Shape(Vec<usize>),
}

/// Magic, version and the raw header text.
fn preamble(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, _) = tag(&MAGIC[..])(input)?;
    let (input, major) = le_u8(input)?;
    let (input, _minor) = le_u8(input)?;
    let (input, len) = if major == 1 {
        map(le_u16, u32::from)(input)?
    } else {
        le_u32(input)?
    };
    take(len)(input)
}

fn quoted(input: &str) -> IResult<&str, &str> {
    delimited(char('\''), take_while(|c| c != '\''), char('\''))(input)
}

fn boolean(input: &str) -> IResult<&str, bool> {
    alt((value(true, tag("True")), value(false, tag("False"))))(input)
}

fn shape(input: &str) -> IResult<&str, Vec<usize>> {
    let dim = map_res(digit1, str::parse::<usize>);
    let sep = delimited(multispace0, char(','), multispace0);
    delimited(
        pair(char('('), multispace0),
        terminated(
            separated_list0(sep, dim),
            pair(opt(preceded(multispace0, char(','))), multispace0),
        ),
        char(')'),
    )(input)
}

fn entry(input: &str) -> IResult<&str, (&str, Value<'_>)> {
    separated_pair(
        preceded(multispace0, quoted),
        tuple((multispace0, char(':'), multispace0)),
        alt((
            map(quoted, Value::Str),
            map(boolean, Value::Bool),
            map(shape, Value::Shape),
        )),
    )(input)
}

fn dict(input: &str) -> IResult<&str, Vec<(&str, Value<'_>)>> {
    delimited(
        char('{'),
        terminated(
            separated_list0(preceded(multispace0, char(',')), entry),
            opt(preceded(multispace0, char(','))),
        ),
        preceded(multispace0, char('}')),
    )(input)
}

/// Parses a complete `.npy` image held in memory.
pub fn parse_npy(bytes: &[u8]) -> Result<NpyArray> {
    let (data, header) =
        preamble(bytes).map_err(|e| anyhow!("not a .npy file: {:?}", e.map_input(|i| i.len())))?;
    let header = std::str::from_utf8(header).context("header is not ASCII")?;
    let (_, entries) = dict(header.trim_start()).map_err(|e| anyhow!("malformed header: {e}"))?;

    let mut descr = None;
    let mut fortran = None;
    let mut dims = None;
    for (key, val) in entries {
        match (key, val) {
            ("descr", Value::Str(s)) => descr = Some(s),
            ("fortran_order", Value::Bool(b)) => fortran = Some(b),
            ("shape", Value::Shape(s)) => dims = Some(s),
            (key, val) => bail!("unexpected header entry {key}: {val:?}"),
        }
    }

    ensure!(descr == Some(DESCR), "element type {descr:?} is not {DESCR}");
    ensure!(fortran == Some(false), "only C-ordered arrays are supported");
    let dims = dims.context("header has no shape")?;
    let [rows, cols] = dims[..] else {
        bail!("expected a 2-D array, found shape {dims:?}");
    };
    ensure!(
        data.len() == rows * cols * 4,
        "expected {} data bytes for shape ({rows}, {cols}), found {}",
        rows * cols * 4,
        data.len()
    );

    Ok(NpyArray {
        rows,
        cols,
        data: data
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect(),
    })
}

/// Loads a `.npy` file written by [`crate::NpyWriter`] or NumPy.
pub fn load_npy<P: AsRef<Path>>(path: P) -> Result<NpyArray> {
    let path = path.as_ref();
    let bytes = fs::read(path).with_context(|| format!("Failed to open {}", path.display()))?;
    parse_npy(&bytes).with_context(|| format!("Failed to parse {}", path.display()))
}
