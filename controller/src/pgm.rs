//! Board I/O against binary PGM (P5) images: byte 0 is a dead cell, any
//! other value alive. Boards load from `images/<W>x<H>.pgm` and save to
//! `out/<W>x<H>x<turn>.pgm`.

use std::path::PathBuf;

use anyhow::{bail, ensure, Context, Result};
use lattice_protocol::Board;

const MAXVAL: usize = 255;

pub fn input_path(width: usize, height: usize) -> PathBuf {
    PathBuf::from("images").join(format!("{width}x{height}.pgm"))
}

pub fn output_path(width: usize, height: usize, turn: u64) -> PathBuf {
    PathBuf::from("out").join(format!("{width}x{height}x{turn}.pgm"))
}

/// Read the starting board for the given dimensions. Any header mismatch is
/// fatal: a wrong file cannot silently seed a session.
pub async fn read_board(width: usize, height: usize) -> Result<Board> {
    let path = input_path(width, height);
    let data = tokio::fs::read(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let cells =
        parse(&data, width, height).with_context(|| format!("bad pgm file {}", path.display()))?;
    Ok(Board::from_cells(cells, width, height))
}

/// Write `board` to the output directory, creating it if needed.
pub async fn write_board(board: &Board, turn: u64) -> Result<()> {
    tokio::fs::create_dir_all("out").await.context("failed to create out/")?;
    let path = output_path(board.width, board.height, turn);
    tokio::fs::write(&path, encode(board))
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), "board saved");
    Ok(())
}

fn encode(board: &Board) -> Vec<u8> {
    let mut data = format!("P5\n{} {}\n{MAXVAL}\n", board.width, board.height).into_bytes();
    data.extend(
        board
            .cells()
            .iter()
            .map(|&alive| if alive { MAXVAL as u8 } else { 0 }),
    );
    data
}

fn parse(data: &[u8], width: usize, height: usize) -> Result<Vec<bool>> {
    let mut pos = 0;
    ensure!(next_token(data, &mut pos) == b"P5", "not a P5 pgm file");
    ensure!(
        parse_number(data, &mut pos)? == width,
        "width does not match the requested board"
    );
    ensure!(
        parse_number(data, &mut pos)? == height,
        "height does not match the requested board"
    );
    ensure!(parse_number(data, &mut pos)? == MAXVAL, "maxval must be 255");

    // A single whitespace byte separates the header from the raster.
    pos += 1;
    ensure!(data.len() >= pos + width * height, "truncated pixel data");
    Ok(data[pos..pos + width * height]
        .iter()
        .map(|&b| b != 0)
        .collect())
}

/// The next whitespace-delimited header token.
fn next_token<'d>(data: &'d [u8], pos: &mut usize) -> &'d [u8] {
    while *pos < data.len() && data[*pos].is_ascii_whitespace() {
        *pos += 1;
    }
    let start = *pos;
    while *pos < data.len() && !data[*pos].is_ascii_whitespace() {
        *pos += 1;
    }
    &data[start..*pos]
}

fn parse_number(data: &[u8], pos: &mut usize) -> Result<usize> {
    let token = next_token(data, pos);
    if token.is_empty() {
        bail!("truncated pgm header");
    }
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .with_context(|| format!("bad header number {:?}", String::from_utf8_lossy(token)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board_with(alive: &[(usize, usize)], w: usize, h: usize) -> Board {
        let mut b = Board::new(w, h);
        for &(x, y) in alive {
            b.set(x, y, true);
        }
        b
    }

    #[test]
    fn encode_then_parse_roundtrips() {
        let board = board_with(&[(0, 0), (2, 1), (3, 3)], 4, 4);
        let cells = parse(&encode(&board), 4, 4).unwrap();
        assert_eq!(cells, board.cells());
    }

    #[test]
    fn any_nonzero_byte_is_alive() {
        let data = b"P5\n2 2\n255\n\x00\x01\xff\x00";
        assert_eq!(
            parse(data, 2, 2).unwrap(),
            vec![false, true, true, false]
        );
    }

    #[test]
    fn rejects_wrong_magic() {
        let err = parse(b"P2\n2 2\n255\n....", 2, 2).unwrap_err();
        assert!(err.to_string().contains("not a P5"));
    }

    #[test]
    fn rejects_mismatched_dimensions() {
        let board = Board::new(4, 4);
        assert!(parse(&encode(&board), 4, 8).is_err());
        assert!(parse(&encode(&board), 8, 4).is_err());
    }

    #[test]
    fn rejects_wrong_maxval() {
        let err = parse(b"P5\n1 1\n16\n\x00", 1, 1).unwrap_err();
        assert!(err.to_string().contains("maxval"));
    }

    #[test]
    fn rejects_truncated_raster() {
        let err = parse(b"P5\n2 2\n255\n\x00\x01", 2, 2).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn paths_follow_the_naming_scheme() {
        assert_eq!(input_path(512, 256), PathBuf::from("images/512x256.pgm"));
        assert_eq!(
            output_path(512, 256, 100),
            PathBuf::from("out/512x256x100.pgm")
        );
    }
}
