use fitrs::{Fits, FitsData, Hdu};
use ndarray::Array2;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{PrepError, Result};

const BLOCK_SIZE: usize = 2880;
const CARD_SIZE: usize = 80;

/// Keywords of one FITS header, values kept as their card text
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct FitsHeader {
    keywords: HashMap<String, String>,
}

impl FitsHeader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse 80-character header cards up to the END card
    pub fn parse(data: &[u8]) -> Self {
        let mut keywords = HashMap::new();

        for chunk in data.chunks(CARD_SIZE) {
            let Ok(card) = std::str::from_utf8(chunk) else {
                continue;
            };
            let card = card.trim_end();

            if card == "END" || card.starts_with("END ") {
                break;
            }

            if card.is_empty() || card.starts_with("COMMENT") || card.starts_with("HISTORY") {
                continue;
            }

            // KEYWORD = VALUE / COMMENT
            if let Some(eq_pos) = card.find('=') {
                let keyword = card[..eq_pos].trim();
                let value = parse_card_value(&card[eq_pos + 1..]);

                if !keyword.is_empty() {
                    keywords.insert(keyword.to_string(), value);
                }
            }
        }

        Self { keywords }
    }

    /// Read the header of HDU `hdu_index` from a file.
    pub fn read_hdu(path: &Path, hdu_index: usize) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut index = 0;
        loop {
            let (header, data_bytes) = read_header_blocks(&mut file)?;
            if index == hdu_index {
                return Ok(header);
            }
            let padded = data_bytes.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
            file.seek(SeekFrom::Current(padded as i64))?;
            index += 1;
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.keywords.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.keywords.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keywords.contains_key(key)
    }

    /// Numeric value of a keyword; Fortran `D` exponents are accepted
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key)
            .and_then(|s| s.replace(['D', 'd'], "E").parse::<f64>().ok())
    }

    /// First keyword of `keys` present with a numeric value
    pub fn get_f64_any(&self, keys: &[&str]) -> Option<f64> {
        keys.iter().find_map(|k| self.get_f64(k))
    }

    pub fn len(&self) -> usize {
        self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    /// Keywords of `other` override keywords of `self`
    pub fn merged_with(&self, other: &FitsHeader) -> FitsHeader {
        let mut keywords = self.keywords.clone();
        keywords.extend(other.keywords.iter().map(|(k, v)| (k.clone(), v.clone())));
        FitsHeader { keywords }
    }

    /// Sorted (keyword, value) pairs
    pub fn sorted(&self) -> Vec<(&str, &str)> {
        let mut pairs: Vec<_> = self
            .keywords
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        pairs.sort_by_key(|&(k, _)| k);
        pairs
    }
}

/// Value part of a card, without comment and quotes
fn parse_card_value(value_part: &str) -> String {
    let trimmed = value_part.trim_start();
    if let Some(rest) = trimmed.strip_prefix('\'') {
        // Quoted string: '' is an escaped quote
        let mut out = String::new();
        let mut chars = rest.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    out.push('\'');
                    chars.next();
                } else {
                    break;
                }
            } else {
                out.push(c);
            }
        }
        return out.trim_end().to_string();
    }

    match trimmed.find('/') {
        Some(comment_pos) => trimmed[..comment_pos].trim().to_string(),
        None => trimmed.trim().to_string(),
    }
}

/// Read header blocks until END; returns the header and its data size in bytes
fn read_header_blocks(file: &mut File) -> Result<(FitsHeader, usize)> {
    let mut header_data = Vec::new();
    loop {
        let mut block = vec![0u8; BLOCK_SIZE];
        file.read_exact(&mut block)
            .map_err(|_| PrepError::Fits("unexpected end of file in header".to_string()))?;
        let has_end = block
            .chunks(CARD_SIZE)
            .any(|card| card.starts_with(b"END") && card[3..].iter().all(|&b| b == b' '));
        header_data.extend_from_slice(&block);
        if has_end {
            break;
        }
    }

    let header = FitsHeader::parse(&header_data);
    Ok((header.clone(), data_size(&header)))
}

fn data_size(header: &FitsHeader) -> usize {
    let naxis = header.get_f64("NAXIS").unwrap_or(0.0) as usize;
    if naxis == 0 {
        return 0;
    }
    let bitpix = header.get_f64("BITPIX").unwrap_or(8.0).abs() as usize;
    let pixels: usize = (1..=naxis)
        .map(|i| header.get_f64(&format!("NAXIS{}", i)).unwrap_or(0.0) as usize)
        .product();
    let pcount = header.get_f64("PCOUNT").unwrap_or(0.0) as usize;
    let gcount = header.get_f64("GCOUNT").unwrap_or(1.0).max(1.0) as usize;
    bitpix / 8 * gcount * (pixels + pcount)
}

/// A 2D image loaded from a FITS file together with its header
pub struct FitsImage {
    pub data: Array2<f64>,
    /// Primary header merged with the header of the image HDU
    pub header: FitsHeader,
    pub hdu_index: usize,
}

impl FitsImage {
    /// Load the first HDU that holds a 2D image
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::load(path, None)
    }

    /// Load image data from a specific HDU, or the first 2D one when `None`
    pub fn load(path: &Path, hdu_index: Option<usize>) -> Result<Self> {
        let fits = Fits::open(path)
            .map_err(|e| PrepError::Fits(format!("failed to open {}: {}", path.display(), e)))?;
        let primary = FitsHeader::read_hdu(path, 0)?;

        let mut index = hdu_index.unwrap_or(0);
        loop {
            let hdu = fits.get(index).ok_or_else(|| {
                PrepError::Fits(format!("no 2D image HDU found in {}", path.display()))
            })?;

            if let Some(data) = read_image(&hdu)? {
                let own = FitsHeader::read_hdu(path, index)?;
                let header = if index == 0 { own } else { primary.merged_with(&own) };
                return Ok(FitsImage {
                    data,
                    header,
                    hdu_index: index,
                });
            }

            if hdu_index.is_some() {
                return Err(PrepError::Fits(format!(
                    "HDU {} of {} does not hold a 2D image",
                    index,
                    path.display()
                )));
            }
            index += 1;
        }
    }

    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    pub fn height(&self) -> usize {
        self.data.nrows()
    }
}

fn header_number(hdu: &Hdu, key: &str) -> Option<f64> {
    match hdu.value(key) {
        Some(fitrs::HeaderValue::IntegerNumber(n)) => Some(*n as f64),
        Some(fitrs::HeaderValue::RealFloatingNumber(f)) => Some(*f),
        _ => None,
    }
}

/// Image data of an HDU as (rows, cols), or None when the HDU has no 2D image
fn read_image(hdu: &Hdu) -> Result<Option<Array2<f64>>> {
    let naxis = header_number(hdu, "NAXIS").unwrap_or(0.0) as usize;
    if naxis < 2 {
        return Ok(None);
    }
    let width = header_number(hdu, "NAXIS1").unwrap_or(0.0) as usize;
    let height = header_number(hdu, "NAXIS2").unwrap_or(0.0) as usize;
    if width == 0 || height == 0 {
        return Ok(None);
    }

    let bzero = header_number(hdu, "BZERO").unwrap_or(0.0);
    let bscale = header_number(hdu, "BSCALE").unwrap_or(1.0);

    let values: Vec<f64> = match hdu.read_data() {
        FitsData::Characters(_) => return Ok(None),
        FitsData::IntegersI32(array) => array
            .data
            .iter()
            .map(|v| match v {
                Some(raw) => *raw as f64 * bscale + bzero,
                None => f64::NAN,
            })
            .collect(),
        FitsData::IntegersU32(array) => array
            .data
            .iter()
            .map(|v| match v {
                Some(raw) => *raw as f64 * bscale + bzero,
                None => f64::NAN,
            })
            .collect(),
        FitsData::FloatingPoint32(array) => array.data.iter().map(|&v| v as f64).collect(),
        FitsData::FloatingPoint64(array) => array.data.iter().copied().collect(),
    };

    // Only the first plane of a cube is used
    let plane = width * height;
    if values.len() < plane {
        return Err(PrepError::Fits(format!(
            "data size mismatch: expected {} pixels, got {}",
            plane,
            values.len()
        )));
    }

    let data = Array2::from_shape_vec((height, width), values[..plane].to_vec())
        .map_err(|e| PrepError::Fits(e.to_string()))?;
    Ok(Some(data))
}

/// Write a 2D array as the primary HDU of a new FITS file
pub fn write_image(path: &Path, data: &Array2<f64>, keywords: &[(&str, f64)]) -> Result<()> {
    let (rows, cols) = data.dim();
    let values: Vec<f64> = data.iter().copied().collect();

    let mut hdu = Hdu::new(&[cols, rows], values);
    for (key, value) in keywords {
        hdu.insert(*key, *value);
    }

    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Fits::create(path, hdu)
        .map_err(|e| PrepError::Fits(format!("failed to write {}: {}", path.display(), e)))?;
    Ok(())
}

/// Format the keywords that matter for preparation
pub fn format_header_summary(header: &FitsHeader, verbose: bool) -> String {
    let mut output = String::new();

    if let Some(object) = header.get("OBJECT").or_else(|| header.get("TARGNAME")) {
        output.push_str(&format!("  Object: {}\n", object));
    }
    if let Some(telescope) = header.get("TELESCOP") {
        output.push_str(&format!("  Telescope: {}\n", telescope));
    }
    if let Some(instrument) = header.get("INSTRUME") {
        output.push_str(&format!("  Instrument: {}\n", instrument));
    }
    if let Some(filter) = header.get("FILTER").or_else(|| header.get("FILTER1")) {
        output.push_str(&format!("  Filter: {}\n", filter));
    }
    match header.get("EXPTIME") {
        Some(exptime) => output.push_str(&format!("  Exposure: {}s\n", exptime)),
        None => output.push_str("  Exposure: not in header\n"),
    }
    if let Some(zp) = header.get_f64_any(&["ZP", "MAGZERO", "PHOTZPT"]) {
        output.push_str(&format!("  Zero-point keyword: {}\n", zp));
    }
    if let Some(bunit) = header.get("BUNIT") {
        output.push_str(&format!("  Units: {}\n", bunit));
    }

    if verbose {
        output.push_str("\nAll Keywords:\n");
        for (key, value) in header.sorted() {
            output.push_str(&format!("  {:<16} = {}\n", key, value));
        }
    }

    output
}
