//! Windowed GeoTIFF reading (without GDAL dependency)
//!
//! Uses the `tiff` crate and decodes only the strips or tiles that intersect
//! the requested window. Every read opens its own decoder, so one
//! [`GeoTiffRaster`] can be shared by many worker threads.

use ndarray::Array3;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::{Path, PathBuf};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;
use tracing::{debug, warn};

use crate::crs::CRS;
use crate::error::{Error, Result};
use crate::raster::{DataType, GeoTransform, PixelWindow, RasterAccess, RasterMetadata};

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GDAL_METADATA: u16 = 42112;
const GDAL_NODATA: u16 = 42113;

const GEOGRAPHIC_TYPE_KEY: u16 = 2048;
const PROJECTED_CS_TYPE_KEY: u16 = 3072;
const USER_DEFINED: u16 = 32767;

/// Strip/tile layout of the first image in the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChunkLayout {
    chunk_width: usize,
    chunk_height: usize,
    samples: usize,
}

impl ChunkLayout {
    fn chunks_across(&self, width: usize) -> usize {
        width.div_ceil(self.chunk_width)
    }
}

/// A GeoTIFF file opened for windowed reads.
///
/// Only the header is parsed on [`open`](GeoTiffRaster::open); pixel data is
/// never cached.
#[derive(Debug, Clone)]
pub struct GeoTiffRaster {
    path: PathBuf,
    metadata: RasterMetadata,
    layout: ChunkLayout,
}

impl GeoTiffRaster {
    /// Parse the header of a GeoTIFF file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut decoder = open_decoder(&path)?;

        let (width, height) = decoder.dimensions()?;
        let width = width as usize;
        let height = height as usize;

        let samples = decoder
            .get_tag_u32(Tag::SamplesPerPixel)
            .map(|v| v as usize)
            .unwrap_or(1);
        let planar = decoder.get_tag_u32(Tag::PlanarConfiguration).unwrap_or(1);
        if planar != 1 {
            return Err(Error::UnsupportedDataType(format!(
                "planar configuration {planar} (only chunky=1 supported)"
            )));
        }

        let data_type = read_data_type(&mut decoder)?;
        let (chunk_width, chunk_height) = decoder.chunk_dimensions();
        let layout = ChunkLayout {
            chunk_width: (chunk_width as usize).max(1),
            chunk_height: (chunk_height as usize).max(1),
            samples,
        };

        let transform = match read_geotransform(&mut decoder) {
            Some(t) => t,
            None => {
                warn!("{}: no georeferencing tags, using pixel coordinates", path.display());
                GeoTransform::new(0.0, 0.0, 1.0, 1.0)
            }
        };

        let mut metadata = RasterMetadata::new(width, height, samples, transform, data_type);
        metadata.crs = read_epsg(&mut decoder).map(CRS::from_epsg);
        metadata.nodata = vec![read_nodata(&mut decoder); samples];
        if let Some(xml) = read_ascii(&mut decoder, GDAL_METADATA) {
            metadata.band_descriptions = parse_band_descriptions(&xml, samples);
        }

        debug!(
            "opened {}: {}x{} px, {} band(s), {}, chunks {}x{}",
            path.display(),
            width,
            height,
            samples,
            data_type,
            layout.chunk_width,
            layout.chunk_height
        );

        Ok(Self {
            path,
            metadata,
            layout,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RasterAccess for GeoTiffRaster {
    fn metadata(&self) -> &RasterMetadata {
        &self.metadata
    }

    fn read_window(&self, window: &PixelWindow, bands: &[usize]) -> Result<Array3<f64>> {
        self.metadata.check_request(window, bands)?;

        let mut decoder = open_decoder(&self.path)?;
        let layout = self.layout;
        let (width, height) = (self.metadata.width, self.metadata.height);
        let across = layout.chunks_across(width);

        let mut out = Array3::<f64>::zeros((bands.len(), window.height, window.width));

        let first_row = window.row_off / layout.chunk_height;
        let last_row = (window.row_end() - 1) / layout.chunk_height;
        let first_col = window.col_off / layout.chunk_width;
        let last_col = (window.col_end() - 1) / layout.chunk_width;

        for chunk_row in first_row..=last_row {
            for chunk_col in first_col..=last_col {
                let index = chunk_row * across + chunk_col;
                let chunk = PixelWindow::new(
                    chunk_row * layout.chunk_height,
                    chunk_col * layout.chunk_width,
                    layout.chunk_height.min(height - chunk_row * layout.chunk_height),
                    layout.chunk_width.min(width - chunk_col * layout.chunk_width),
                );
                let Some(overlap) = chunk.intersection(window) else {
                    continue;
                };

                let values = decoding_to_f64(decoder.read_chunk(index as u32)?)?;
                let stride = chunk_stride(values.len(), &chunk, &layout)?;

                for row in overlap.row_off..overlap.row_end() {
                    for col in overlap.col_off..overlap.col_end() {
                        let pixel =
                            (row - chunk.row_off) * stride + (col - chunk.col_off);
                        for (i, &band) in bands.iter().enumerate() {
                            out[[i, row - window.row_off, col - window.col_off]] =
                                values[pixel * layout.samples + band];
                        }
                    }
                }
            }
        }

        Ok(out)
    }
}

fn open_decoder(path: &Path) -> Result<Decoder<BufReader<File>>> {
    let file = File::open(path)?;
    Ok(Decoder::new(BufReader::new(file))?)
}

/// Row stride of a decoded chunk buffer: edge chunks are either cropped to
/// the image or padded to the full chunk size.
fn chunk_stride(len: usize, chunk: &PixelWindow, layout: &ChunkLayout) -> Result<usize> {
    if len == chunk.pixel_count() * layout.samples {
        Ok(chunk.width)
    } else if len >= layout.chunk_width * chunk.height * layout.samples {
        Ok(layout.chunk_width)
    } else {
        Err(Error::Tiff(format!(
            "chunk {} decoded to {} samples, expected {}",
            chunk,
            len,
            chunk.pixel_count() * layout.samples
        )))
    }
}

fn decoding_to_f64(result: DecodingResult) -> Result<Vec<f64>> {
    let values = match result {
        DecodingResult::U8(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::U16(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::U32(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::U64(buf) => buf.into_iter().map(|v| v as f64).collect(),
        DecodingResult::I8(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::I16(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::I32(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::I64(buf) => buf.into_iter().map(|v| v as f64).collect(),
        DecodingResult::F32(buf) => buf.into_iter().map(f64::from).collect(),
        DecodingResult::F64(buf) => buf,
        #[allow(unreachable_patterns)]
        _ => return Err(Error::UnsupportedDataType("Unsupported TIFF pixel format".to_string())),
    };
    Ok(values)
}

fn read_data_type<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<DataType> {
    let bits = decoder
        .get_tag_u32_vec(Tag::BitsPerSample)
        .ok()
        .and_then(|v| v.first().copied())
        .unwrap_or(8);
    let format = decoder
        .get_tag_u32_vec(Tag::SampleFormat)
        .ok()
        .and_then(|v| v.first().copied())
        .unwrap_or(1);

    let data_type = match (format, bits) {
        (1, 8) => DataType::U8,
        (1, 16) => DataType::U16,
        (1, 32) => DataType::U32,
        (1, 64) => DataType::U64,
        (2, 8) => DataType::I8,
        (2, 16) => DataType::I16,
        (2, 32) => DataType::I32,
        (2, 64) => DataType::I64,
        (3, 32) => DataType::F32,
        (3, 64) => DataType::F64,
        _ => {
            return Err(Error::UnsupportedDataType(format!(
                "bits_per_sample={bits}, sample_format={format}"
            )));
        }
    };
    Ok(data_type)
}

/// Read the affine transform from ModelTransformationTag, or from
/// ModelPixelScaleTag + ModelTiepointTag
fn read_geotransform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<GeoTransform> {
    if let Ok(m) = decoder.get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_TRANSFORMATION))
        && m.len() >= 8
    {
        return Some(GeoTransform::from_gdal([m[3], m[0], m[1], m[7], m[4], m[5]]));
    }

    let scale = decoder
        .get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_PIXEL_SCALE))
        .ok()?;
    let tiepoint = decoder
        .get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_TIEPOINT))
        .ok()?;

    if scale.len() >= 2 && tiepoint.len() >= 6 {
        // tiepoint: [I, J, K, X, Y, Z], scale: [ScaleX, ScaleY, ScaleZ]
        let origin_x = tiepoint[3] - tiepoint[0] * scale[0];
        let origin_y = tiepoint[4] + tiepoint[1] * scale[1];
        return Some(GeoTransform::new(origin_x, origin_y, scale[0], -scale[1]));
    }
    None
}

/// EPSG code from the GeoKey directory (projected first, then geographic)
fn read_epsg<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<u32> {
    let keys = decoder
        .get_tag_u16_vec(Tag::from_u16_exhaustive(GEO_KEY_DIRECTORY))
        .ok()?;
    epsg_from_geokeys(&keys)
}

fn epsg_from_geokeys(keys: &[u16]) -> Option<u32> {
    let count = *keys.get(3)? as usize;
    let entries: Vec<&[u16]> = keys[4..].chunks_exact(4).take(count).collect();

    [PROJECTED_CS_TYPE_KEY, GEOGRAPHIC_TYPE_KEY]
        .iter()
        .find_map(|&wanted| {
            entries
                .iter()
                .find(|e| e[0] == wanted && e[1] == 0 && e[3] != USER_DEFINED && e[3] != 0)
                .map(|e| u32::from(e[3]))
        })
}

fn read_ascii<R: Read + Seek>(decoder: &mut Decoder<R>, tag: u16) -> Option<String> {
    decoder
        .get_tag_ascii_string(Tag::from_u16_exhaustive(tag))
        .ok()
}

fn read_nodata<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<f64> {
    let text = read_ascii(decoder, GDAL_NODATA)?;
    let text = text.trim_matches(char::from(0)).trim();
    if text.eq_ignore_ascii_case("nan") {
        return Some(f64::NAN);
    }
    text.parse().ok()
}

/// Band descriptions from GDAL's metadata XML
/// (`<Item name="DESCRIPTION" sample="0" role="description">NIR</Item>`).
/// Malformed XML yields whatever was read before the error.
fn parse_band_descriptions(xml: &str, bands: usize) -> Vec<Option<String>> {
    let mut out = vec![None; bands];
    let mut reader = Reader::from_str(xml.trim_end_matches(char::from(0)));
    reader.trim_text(true);

    // Band of the DESCRIPTION item currently open
    let mut open: Option<usize> = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"Item" => {
                open = description_band(e).filter(|&band| band < bands);
            }
            Ok(Event::Text(ref e)) => {
                if let Some(band) = open
                    && let Ok(text) = e.unescape()
                    && !text.trim().is_empty()
                {
                    out[band] = Some(text.trim().to_string());
                }
            }
            Ok(Event::End(_)) => open = None,
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!("malformed GDAL metadata at byte {}: {}", reader.buffer_position(), e);
                break;
            }
            _ => {}
        }
    }
    out
}

fn description_band(item: &BytesStart<'_>) -> Option<usize> {
    let attribute = |key: &str| -> Option<String> {
        let attr = item.try_get_attribute(key).ok().flatten()?;
        attr.unescape_value().ok().map(|v| v.into_owned())
    };
    if attribute("name")? != "DESCRIPTION" {
        return None;
    }
    attribute("sample")?.trim().parse().ok()
}
