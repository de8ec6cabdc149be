use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use itertools::Itertools;
use phylotree::tree::Tree as PhyloTree;
use tracing::debug;

use crate::error::SolverError;
use crate::similarity::SimilarityMatrix;

fn is_gz(path: &Path) -> bool {
    path.to_string_lossy().ends_with(".gz")
}

fn open_reader(path: &Path) -> io::Result<Box<dyn BufRead>> {
    let f = File::open(path)?;
    if is_gz(path) {
        Ok(Box::new(BufReader::new(GzDecoder::new(f))))
    } else {
        Ok(Box::new(BufReader::new(f)))
    }
}

/// Opens `path` for writing; `-` is stdout and a `.gz` suffix compresses.
fn open_writer(path: &Path) -> io::Result<Box<dyn Write>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(BufWriter::new(io::stdout())));
    }
    let f = File::create(path)?;
    if is_gz(path) {
        Ok(Box::new(BufWriter::new(GzEncoder::new(f, Compression::default()))))
    } else {
        Ok(Box::new(BufWriter::new(f)))
    }
}

/// Read observation trees from a plain or gzipped file.
///
/// Two layouts are accepted: one newick tree per line (blank lines skipped),
/// or a NEXUS file with a `trees` block whose optional `TRANSLATE` table maps
/// leaf tokens to taxon names.
pub fn read_newick_trees<P: AsRef<Path>>(path: P) -> Result<Vec<PhyloTree>, SolverError> {
    let mut content = String::new();
    open_reader(path.as_ref())?.read_to_string(&mut content)?;

    let trees = if content.trim_start().to_ascii_uppercase().starts_with("#NEXUS") {
        parse_nexus(&content)?
    } else {
        parse_lines(&content)?
    };
    debug!("read {} trees from {}", trees.len(), path.as_ref().display());
    Ok(trees)
}

fn parse_newick(index: usize, newick: &str) -> Result<PhyloTree, SolverError> {
    PhyloTree::from_newick(newick).map_err(|e| SolverError::Newick { index, message: e.to_string() })
}

fn parse_lines(content: &str) -> Result<Vec<PhyloTree>, SolverError> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(index, line)| parse_newick(index, line))
        .collect()
}

fn parse_nexus(content: &str) -> Result<Vec<PhyloTree>, SolverError> {
    let translate = parse_translate_block(content);
    let mut trees = Vec::new();
    for (index, body) in tree_statements(content).into_iter().enumerate() {
        let mut tree = parse_newick(index, strip_comments(body).trim())?;
        if !translate.is_empty() {
            rename_leaves(&mut tree, &translate);
        }
        trees.push(tree);
    }
    Ok(trees)
}

/// Bodies of the `tree NAME = ...;` statements.
fn tree_statements(content: &str) -> Vec<&str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| line.to_ascii_uppercase().starts_with("TREE "))
        .filter_map(|line| line.split_once('=').map(|(_, body)| body.trim()))
        .collect()
}

/// Removes bracketed comments such as `[&R]` or `[&rate=0.1]`.
fn strip_comments(newick: &str) -> String {
    let mut out = String::with_capacity(newick.len());
    let mut depth = 0usize;
    for ch in newick.chars() {
        match ch {
            '[' => depth += 1,
            ']' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(ch),
            _ => {}
        }
    }
    out
}

fn parse_translate_block(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .skip_while(|line| !line.trim().to_ascii_uppercase().starts_with("TRANSLATE"))
        .skip(1)
        .take_while(|line| !line.trim().starts_with(';'))
        // 1 'Homo sapiens',
        .filter_map(|line| {
            let line = line.trim().trim_end_matches([',', ';']);
            let (token, label) = line.split_once(char::is_whitespace)?;
            Some((token.to_string(), label.trim().trim_matches('\'').to_string()))
        })
        .collect()
}

fn rename_leaves(tree: &mut PhyloTree, translate: &HashMap<String, String>) {
    for leaf in tree.get_leaves() {
        if let Ok(node) = tree.get_mut(&leaf) {
            if let Some(label) = node.name.as_ref().and_then(|n| translate.get(n)) {
                node.name = Some(label.clone());
            }
        }
    }
}

/// Read individual-to-species assignments, one species per line:
/// `species: individual1, individual2`. Returns `(individual, species)` pairs.
pub fn read_species_mapping<P: AsRef<Path>>(path: P) -> Result<Vec<(String, String)>, SolverError> {
    let mut pairs = Vec::new();
    for line in open_reader(path.as_ref())?.lines() {
        let line = line?;
        let Some((species, members)) = line.split_once(':') else {
            continue;
        };
        let species = species.trim();
        for member in members.split(',').map(str::trim).filter(|m| !m.is_empty()) {
            pairs.push((member.to_string(), species.to_string()));
        }
    }
    Ok(pairs)
}

/// Write a newick string followed by a newline.
pub fn write_newick<P: AsRef<Path>>(path: P, newick: &str) -> io::Result<()> {
    let mut out = open_writer(path.as_ref())?;
    writeln!(&mut out, "{newick}")?;
    out.flush()
}

/// Write a similarity matrix as a labeled TSV.
/// If `path` ends with `.gz`, the output is gzip-compressed; `-` writes to stdout.
pub fn write_matrix_tsv<P: AsRef<Path>>(path: P, names: &[String], matrix: &SimilarityMatrix) -> io::Result<()> {
    if names.len() != matrix.size() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} names for a matrix of size {}", names.len(), matrix.size()),
        ));
    }
    let mut out = open_writer(path.as_ref())?;

    // Header row
    writeln!(&mut out, "\t{}", names.iter().join("\t"))?;

    for (name, row) in names.iter().zip(matrix.values()) {
        writeln!(&mut out, "{}\t{}", name, row.iter().map(|v| format!("{v:.6}")).join("\t"))?;
    }

    out.flush()
}
