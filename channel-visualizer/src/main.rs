use anyhow::{Context, Result};
use channel_common::{read_archive, read_grid_csv, FieldArchive, Grid, OutputFormat};
use clap::{Parser, Subcommand};
use env_logger::Builder;
use image::{ImageBuffer, Rgb, RgbImage};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn, LevelFilter};
use minimp4::Mp4Muxer;
use openh264::encoder::{BitRate, Encoder, EncoderConfig, FrameRate};
use openh264::formats::YUVBuffer;
use palette::{FromColor, Hsv, Srgb};
use plotters::prelude::*;
use rayon::prelude::*;
use std::fs;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Post-processing for channel-flow output directories
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory written by the channel-flow engine
    #[arg(short, long, default_value = "output")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compare the last ux frame's cross-channel profile with the analytic parabola 4y(1-y)
    Profile {
        /// Column to sample (defaults to the middle of the channel)
        #[arg(long)]
        column: Option<usize>,
        /// Optional PNG chart of both profiles
        #[arg(long)]
        plot: Option<PathBuf>,
    },
    /// ux along a row of the final field (defaults to the channel midline)
    Midline {
        #[arg(long)]
        row: Option<usize>,
        #[arg(long)]
        plot: Option<PathBuf>,
    },
    /// Max |delta ux| between successive ux frames
    Convergence {
        #[arg(long)]
        plot: Option<PathBuf>,
    },
    /// Colour-mapped velocity magnitude of the final fields
    Contour {
        #[arg(short, long, default_value = "velocity_contour.png")]
        output: PathBuf,
        /// Pixels per lattice cell
        #[arg(long, default_value_t = 4)]
        scale: u32,
    },
    /// Encode the ux frames into an MP4 video
    Animate {
        #[arg(short, long, default_value = "ux_animation.mp4")]
        output: PathBuf,
        #[arg(long, default_value_t = 5)]
        fps: u32,
        /// Pixels per lattice cell (rounded up to an even number for YUV 4:2:0)
        #[arg(long, default_value_t = 2)]
        scale: u32,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    run_with_args(args)
}

fn run_with_args(args: Args) -> Result<()> {
    // Initialize logger
    Builder::from_default_env()
        .filter(None, LevelFilter::Info)
        .init();

    info!("Starting Channel Flow Visualizer on {}", args.dir.display());
    match args.command {
        Command::Profile { column, plot } => profile(&args.dir, column, plot.as_deref()),
        Command::Midline { row, plot } => midline(&args.dir, row, plot.as_deref()),
        Command::Convergence { plot } => convergence(&args.dir, plot.as_deref()),
        Command::Contour { output, scale } => contour(&args.dir, &output, scale),
        Command::Animate { output, fps, scale } => animate(&args.dir, &output, fps, scale),
    }
}

/// Finds `<stem>.{bin,msgpack,json}[.zst]` in the output directory, compressed archives first.
fn find_archive(dir: &Path, stem: &str) -> Result<PathBuf> {
    [OutputFormat::Bincode, OutputFormat::Messagepack, OutputFormat::Json]
        .into_iter()
        .flat_map(|format| [format.archive_file_name(stem), format!("{}.{}", stem, format.extension())])
        .map(|name| dir.join(name))
        .find(|path| path.exists())
        .with_context(|| format!("No {} archive found in '{}'", stem, dir.display()))
}

fn load_ux_history(dir: &Path) -> Result<FieldArchive> {
    let path = find_archive(dir, "ux_history")?;
    let archive = read_archive(&path)?;
    info!("Loaded {} frames ({}x{}) from {}", archive.len(), archive.nx, archive.ny, path.display());
    Ok(archive)
}

// --- Profile comparison ---

/// Profile divided by its maximum; an all-zero profile is returned unchanged.
fn normalized(profile: &[f64]) -> Vec<f64> {
    let peak = profile.iter().cloned().fold(f64::MIN, f64::max);
    if peak > 0.0 {
        profile.iter().map(|v| v / peak).collect()
    } else {
        profile.to_vec()
    }
}

/// 4 s (1 - s) sampled at s = row / (ny - 1).
fn analytic_profile(ny: usize) -> Vec<f64> {
    (0..ny)
        .map(|row| {
            let s = if ny > 1 { row as f64 / (ny - 1) as f64 } else { 0.0 };
            4.0 * s * (1.0 - s)
        })
        .collect()
}

fn max_deviation(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
}

fn profile(dir: &Path, column: Option<usize>, plot: Option<&Path>) -> Result<()> {
    let archive = load_ux_history(dir)?;
    let frame = archive.last_frame().context("ux history holds no frames")?;
    let col = column.unwrap_or(archive.nx / 2);
    if col >= archive.nx {
        anyhow::bail!("Column {} outside channel of width {}.", col, archive.nx);
    }

    let grid = Grid { nx: archive.nx, ny: archive.ny, values: frame.to_vec() };
    let lbm = normalized(&grid.column(col));
    let analytic = analytic_profile(grid.ny);
    let deviation = max_deviation(&lbm, &analytic);
    info!("Column {}: max |u/u_max - 4y(1-y)| = {:.4}", col, deviation);
    for (row, (n, a)) in lbm.iter().zip(&analytic).enumerate() {
        log::debug!("row {:4}: lbm {:.5} analytic {:.5}", row, n, a);
    }

    if let Some(path) = plot {
        let ys: Vec<f64> = (0..grid.ny).map(|row| row as f64 / (grid.ny - 1).max(1) as f64).collect();
        draw_line_chart(
            path,
            "Velocity profile at final frame",
            "y",
            "u / u_max",
            &[
                Series { label: "LBM (normalized)", color: BLUE, points: ys.iter().cloned().zip(lbm).collect() },
                Series { label: "Analytical", color: RED, points: ys.iter().cloned().zip(analytic).collect() },
            ],
        )?;
        info!("Profile chart saved to {}", path.display());
    }
    Ok(())
}

fn midline(dir: &Path, row: Option<usize>, plot: Option<&Path>) -> Result<()> {
    let ux = read_grid_csv(&dir.join("ux_final.csv"))?;
    let row = row.unwrap_or(ux.ny / 2);
    if row >= ux.ny {
        anyhow::bail!("Row {} outside channel of height {}.", row, ux.ny);
    }
    let line = ux.row(row);
    let peak = line.iter().cloned().fold(f64::MIN, f64::max);
    info!("Row {}: ux ranges from {:.5} (inlet) to {:.5} (outlet), peak {:.5}", row, line[0], line[ux.nx - 1], peak);

    if let Some(path) = plot {
        let points = line.iter().enumerate().map(|(x, &u)| (x as f64, u)).collect();
        draw_line_chart(
            path,
            "Midchannel velocity profile",
            "x",
            "ux",
            &[Series { label: "Numerical", color: BLUE, points }],
        )?;
        info!("Midline chart saved to {}", path.display());
    }
    Ok(())
}

// --- Convergence ---

/// max |frame[i] - frame[i-1]| for each consecutive pair of frames.
fn frame_differences(archive: &FieldArchive) -> Vec<f64> {
    let frames: Vec<&Vec<f64>> = archive.frames.values().collect();
    frames
        .windows(2)
        .map(|pair| max_deviation(pair[1], pair[0]))
        .collect()
}

fn convergence(dir: &Path, plot: Option<&Path>) -> Result<()> {
    let archive = load_ux_history(dir)?;
    if archive.len() < 2 {
        warn!("Need at least two frames to measure convergence; found {}.", archive.len());
        return Ok(());
    }
    let diffs = frame_differences(&archive);
    for (i, d) in diffs.iter().enumerate() {
        info!("frame {} -> {} (step {}): max |delta ux| = {:.3e}", i, i + 1, archive.steps[i + 1], d);
    }

    if let Some(path) = plot {
        // Zero differences have no logarithm; clamp them to the smallest positive double.
        let points = diffs
            .iter()
            .enumerate()
            .map(|(i, &d)| (i as f64, d.max(f64::MIN_POSITIVE).log10()))
            .collect();
        draw_line_chart(
            path,
            "Convergence check: successive frame differences",
            "Frame index",
            "log10 max |delta u|",
            &[Series { label: "Max difference between frames", color: BLUE, points }],
        )?;
        info!("Convergence chart saved to {}", path.display());
    }
    Ok(())
}

// --- Charts ---

struct Series {
    label: &'static str,
    color: RGBColor,
    points: Vec<(f64, f64)>,
}

fn plot_err<E: std::fmt::Display>(e: E) -> anyhow::Error {
    anyhow::anyhow!("Plotting failed: {}", e)
}

fn draw_line_chart(path: &Path, title: &str, x_desc: &str, y_desc: &str, series: &[Series]) -> Result<()> {
    let (mut x_min, mut x_max, mut y_min, mut y_max) = (f64::MAX, f64::MIN, f64::MAX, f64::MIN);
    for &(x, y) in series.iter().flat_map(|s| s.points.iter()) {
        x_min = x_min.min(x);
        x_max = x_max.max(x);
        y_min = y_min.min(y);
        y_max = y_max.max(y);
    }
    if x_min > x_max {
        anyhow::bail!("Nothing to plot for '{}'.", title);
    }
    let pad = ((y_max - y_min) * 0.05).max(1e-12);

    let root = BitMapBackend::new(path, (900, 540)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;
    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 22))
        .margin(12)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(x_min..x_max.max(x_min + 1e-12), (y_min - pad)..(y_max + pad))
        .map_err(plot_err)?;
    chart
        .configure_mesh()
        .x_desc(x_desc)
        .y_desc(y_desc)
        .draw()
        .map_err(plot_err)?;

    for s in series {
        let color = s.color;
        chart
            .draw_series(LineSeries::new(s.points.iter().copied(), color.stroke_width(2)))
            .map_err(plot_err)?
            .label(s.label)
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2)));
    }
    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()
        .map_err(plot_err)?;
    root.present().map_err(plot_err)?;
    Ok(())
}

// --- Heat maps ---

/// Blue (low) to red (high) colour ramp through the HSV hue circle.
fn colormap(t: f64) -> [u8; 3] {
    let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
    let hsv = Hsv::new((1.0 - t as f32) * 240.0, 0.9, 0.95);
    let rgb: Srgb = Srgb::from_color(hsv);
    [
        (rgb.red * 255.0).round() as u8,
        (rgb.green * 255.0).round() as u8,
        (rgb.blue * 255.0).round() as u8,
    ]
}

/// Renders a (ny, nx) field with row 0 at the bottom of the image.
fn render_field(values: &[f64], nx: usize, ny: usize, scale: u32, range: (f64, f64)) -> RgbImage {
    let (lo, hi) = range;
    let span = if hi > lo { hi - lo } else { 1.0 };
    let width = nx as u32 * scale;
    let height = ny as u32 * scale;
    ImageBuffer::from_fn(width, height, |px, py| {
        let col = (px / scale) as usize;
        let row = ny - 1 - (py / scale) as usize; // Flip Y (lattice origin is bottom-left)
        Rgb(colormap((values[row * nx + col] - lo) / span))
    })
}

fn value_range<'a>(values: impl Iterator<Item = &'a f64>) -> (f64, f64) {
    values
        .filter(|v| v.is_finite())
        .fold((f64::MAX, f64::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

fn contour(dir: &Path, output: &Path, scale: u32) -> Result<()> {
    let ux = read_grid_csv(&dir.join("ux_final.csv"))?;
    let uy = read_grid_csv(&dir.join("uy_final.csv"))?;
    if (ux.nx, ux.ny) != (uy.nx, uy.ny) {
        anyhow::bail!("ux ({}x{}) and uy ({}x{}) grids differ in shape.", ux.nx, ux.ny, uy.nx, uy.ny);
    }
    let speed: Vec<f64> = ux.values.iter().zip(&uy.values).map(|(a, b)| (a * a + b * b).sqrt()).collect();
    let range = value_range(speed.iter());
    info!("Velocity magnitude range: {:.5} .. {:.5}", range.0, range.1);

    let image = render_field(&speed, ux.nx, ux.ny, scale.max(1), range);
    image
        .save(output)
        .with_context(|| format!("Failed to write contour image to {}", output.display()))?;
    info!("Contour saved to {}", output.display());
    Ok(())
}

// --- Animation ---

/// Band above the field holding the frame label.
const HEADER_PX: u32 = 24;
/// Band below the field holding the colour bar and its limits.
const FOOTER_PX: u32 = 36;
const COLORBAR_MARGIN_PX: u32 = 8;

fn frame_label(index: usize, step: u64, values: &[f64]) -> String {
    let (_, max) = value_range(values.iter());
    format!("Frame {} | step {} | Max: {:.4}", index, step, max)
}

/// Field plus a white header band and a footer colour bar spanning `range`.
fn compose_frame(values: &[f64], nx: usize, ny: usize, scale: u32, range: (f64, f64)) -> RgbImage {
    let field = render_field(values, nx, ny, scale, range);
    let width = field.width();
    let mut canvas = RgbImage::from_pixel(width, HEADER_PX + field.height() + FOOTER_PX, Rgb([255, 255, 255]));
    image::imageops::replace(&mut canvas, &field, 0, HEADER_PX as i64);

    let bar_top = HEADER_PX + field.height() + 4;
    let bar_span = width.saturating_sub(2 * COLORBAR_MARGIN_PX).max(1);
    for x in 0..bar_span {
        let t = x as f64 / (bar_span - 1).max(1) as f64;
        let color = Rgb(colormap(t));
        for y in bar_top..bar_top + 10 {
            canvas.put_pixel((COLORBAR_MARGIN_PX + x).min(width - 1), y, color);
        }
    }
    canvas
}

/// Writes the frame label and the colour bar limits onto a composed frame.
fn annotate_frame(canvas: &mut RgbImage, label: &str, range: (f64, f64)) -> Result<()> {
    let (width, height) = canvas.dimensions();
    let buffer: &mut [u8] = canvas;
    let root = BitMapBackend::with_buffer(buffer, (width, height)).into_drawing_area();
    let title = ("sans-serif", 16).into_font().color(&BLACK);
    let limits = ("sans-serif", 12).into_font().color(&BLACK);

    root.draw_text(label, &title, (COLORBAR_MARGIN_PX as i32, 4)).map_err(plot_err)?;
    let text_y = (height - FOOTER_PX + 18) as i32;
    root.draw_text(&format!("{:.4}", range.0), &limits, (COLORBAR_MARGIN_PX as i32, text_y))
        .map_err(plot_err)?;
    let max_text = format!("{:.4}", range.1);
    let max_x = width as i32 - COLORBAR_MARGIN_PX as i32 - 7 * max_text.len() as i32;
    root.draw_text(&max_text, &limits, (max_x.max(0), text_y)).map_err(plot_err)?;
    root.present().map_err(plot_err)?;
    Ok(())
}

/// BT.601 full-range luma and chroma of one RGB pixel.
#[inline]
fn bt601(pixel: &Rgb<u8>) -> (f32, f32, f32) {
    let [r, g, b] = pixel.0.map(f32::from);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let u = 128.0 - 0.169 * r - 0.331 * g + 0.5 * b;
    let v = 128.0 + 0.5 * r - 0.419 * g - 0.081 * b;
    (y, u, v)
}

/// Packs an even-sized RGB frame into planar I420: full Y, then U and V averaged over 2x2 blocks.
fn to_i420(image: &RgbImage) -> Vec<u8> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    debug_assert!(width % 2 == 0 && height % 2 == 0);
    let (cw, ch) = (width / 2, height / 2);
    let mut luma = Vec::with_capacity(width * height + 2 * cw * ch);
    let mut u_plane = vec![0f32; cw * ch];
    let mut v_plane = vec![0f32; cw * ch];

    for (x, y, pixel) in image.enumerate_pixels() {
        let (l, u, v) = bt601(pixel);
        luma.push(l.round().clamp(0.0, 255.0) as u8);
        let block = (y as usize / 2) * cw + x as usize / 2;
        u_plane[block] += u * 0.25;
        v_plane[block] += v * 0.25;
    }
    let quantize = |c: f32| c.round().clamp(0.0, 255.0) as u8;
    luma.extend(u_plane.into_iter().map(quantize));
    luma.extend(v_plane.into_iter().map(quantize));
    luma
}

fn animate(dir: &Path, output: &Path, fps: u32, scale: u32) -> Result<()> {
    let archive = load_ux_history(dir)?;
    if archive.is_empty() {
        warn!("ux history contains no frames. Exiting.");
        return Ok(());
    }
    // I420 needs even dimensions; the header and footer bands already are
    let scale = scale.max(1);
    let scale = if scale % 2 == 1 { scale + 1 } else { scale };
    let (nx, ny) = (archive.nx, archive.ny);
    let width = nx as u32 * scale;
    let height = HEADER_PX + ny as u32 * scale + FOOTER_PX;
    // One colour scale for the whole video so frames are comparable
    let range = value_range(archive.frames.values().flatten());
    info!("Rendering {} frames at {}x{} px, ux range {:.5} .. {:.5}", archive.len(), width, height, range.0, range.1);

    let progress_bar = ProgressBar::new(archive.len() as u64);
    progress_bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} frames ({percent}%) [{eta}]")
            .context("Invalid progress bar template")?
            .progress_chars("#>-"),
    );

    let start_time = Instant::now();
    // Render and convert in parallel; collect preserves frame order
    let frames: Vec<(u64, &Vec<f64>)> = archive.steps.iter().copied().zip(archive.frames.values()).collect();
    let yuv_frames: Vec<Vec<u8>> = frames
        .par_iter()
        .enumerate()
        .map(|(index, (step, values))| {
            let mut canvas = compose_frame(values, nx, ny, scale, range);
            annotate_frame(&mut canvas, &frame_label(index, *step, values), range)
                .with_context(|| format!("Failed to label frame {}", index))?;
            progress_bar.inc(1);
            Ok(to_i420(&canvas))
        })
        .collect::<Result<_>>()?;
    progress_bar.finish_with_message("Rendered");

    let mut encoder = Encoder::with_api_config(
        openh264::OpenH264API::from_source(),
        EncoderConfig::new()
            .max_frame_rate(FrameRate::from_hz(fps.max(1) as f32))
            .bitrate(BitRate::from_bps(5_000_000)),
    )
    .context("Failed to initialize H.264 encoder")?;

    let mut h264_data = Vec::new();
    for (i, yuv) in yuv_frames.into_iter().enumerate() {
        let source = YUVBuffer::from_vec(yuv, width as usize, height as usize);
        let bitstream = encoder
            .encode(&source)
            .with_context(|| format!("Failed to encode frame {}", i))?;
        bitstream.write_vec(&mut h264_data);
    }

    let mut video_buffer = Cursor::new(Vec::new());
    let mut mp4muxer = Mp4Muxer::new(&mut video_buffer);
    let description = format!("2D channel flow: ux, {} frames", archive.len());
    mp4muxer.init_video(width as i32, height as i32, false, &description);
    mp4muxer.write_video(&h264_data);
    mp4muxer.close();

    video_buffer.seek(SeekFrom::Start(0))?;
    let mut video_bytes = Vec::new();
    video_buffer.read_to_end(&mut video_bytes)?;
    fs::write(output, &video_bytes)
        .with_context(|| format!("Failed to write video file to {}", output.display()))?;

    info!(
        "Animation saved to {} in {:.2?} ({} frames)",
        output.display(),
        start_time.elapsed(),
        archive.len()
    );
    Ok(())
}
