use clap::{Parser, ValueEnum};
use dipole_psf::{CylindricalLens, IsotropicRequest, Microscope, OpticalConfig};
use log::info;
use ndarray::Array2;
use std::{
    error::Error,
    path::{Path, PathBuf},
};
use uom::si::{
    f64::Length,
    length::{micron, millimeter, nanometer},
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Lens {
    None,
    Weak,
    Strong,
}

impl From<Lens> for CylindricalLens {
    fn from(lens: Lens) -> Self {
        match lens {
            Lens::None => CylindricalLens::None,
            Lens::Weak => CylindricalLens::Weak,
            Lens::Strong => CylindricalLens::Strong,
        }
    }
}

/// Simulates the camera image of an isotropic emitter.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long, default_value_t = 1.49)]
    numerical_aperture: f64,

    #[arg(long, default_value_t = 600.0)]
    wavelength_nm: f64,

    #[arg(long, default_value_t = 1.518)]
    n_immersion: f64,

    #[arg(long, default_value_t = 1.33)]
    n_sample: f64,

    #[arg(long, default_value_t = 100.0)]
    magnification: f64,

    #[arg(long, default_value_t = 180.0)]
    tube_focal_length_mm: f64,

    #[arg(long, default_value_t = 300.0)]
    relay_first_mm: f64,

    #[arg(long, default_value_t = 200.0)]
    relay_second_mm: f64,

    #[arg(long, default_value_t = 256)]
    pupil_resolution: usize,

    #[arg(long, default_value_t = 2.0)]
    focal_shift_exponent: f64,

    #[arg(short, long, value_enum, default_value_t = Lens::None)]
    lens: Lens,

    /// Defocus relative to best focus.
    #[arg(short, long, default_value_t = 0.0, allow_negative_numbers = true)]
    z_defocus_um: f64,

    /// Emitter distance past the interface.
    #[arg(short, long, default_value_t = 0.0)]
    depth_um: f64,

    #[arg(short, long, default_value_t = 0.0, allow_negative_numbers = true)]
    astigmatism: f64,

    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    spherical_correction: f64,

    #[arg(long, default_value_t = 8)]
    oversampling: usize,

    #[arg(short, long, default_value_t = 6.5)]
    pixel_um: f64,

    /// Full width of the central region to keep.
    #[arg(long)]
    fov_um: Option<f64>,

    #[arg(short, long)]
    output: PathBuf,

    /// Also write the pupil intensity.
    #[arg(long)]
    pupil_output: Option<PathBuf>,

    /// Write the pupil phase instead of its intensity.
    #[arg(long, requires = "pupil_output")]
    pupil_phase: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = OpticalConfig::builder()
        .numerical_aperture(args.numerical_aperture)
        .wavelength(Length::new::<nanometer>(args.wavelength_nm))
        .n_immersion(args.n_immersion)
        .n_sample(args.n_sample)
        .objective_magnification(args.magnification)
        .tube_focal_length(Length::new::<millimeter>(args.tube_focal_length_mm))
        .relay_focal_lengths(
            Length::new::<millimeter>(args.relay_first_mm),
            Length::new::<millimeter>(args.relay_second_mm),
        )
        .pupil_resolution(args.pupil_resolution)
        .focal_shift_exponent(args.focal_shift_exponent)
        .build()?;
    let microscope = Microscope::new(config)?;

    let mut request = IsotropicRequest::default()
        .with_z_defocus(Length::new::<micron>(args.z_defocus_um))
        .with_depth(Length::new::<micron>(args.depth_um))
        .with_astigmatism(args.astigmatism)
        .with_spherical_correction(args.spherical_correction)
        .with_oversampling(args.oversampling)
        .with_camera_pixel_size(Length::new::<micron>(args.pixel_um));

    let lens = CylindricalLens::from(args.lens);
    if let Some(mask) = lens
        .focal_length()
        .and_then(|focal_length| microscope.cylindrical_phase(focal_length))
    {
        request = request.with_phase_mask(mask);
    }
    if let Some(fov) = args.fov_um {
        request = request.with_display_field_of_view(Length::new::<micron>(fov));
    }

    let result = microscope.simulate_isotropic(&request)?;
    let stats = result.stats();
    info!(
        "{:?} lens, {}x{} camera pixels over {:.2} um ({:?})",
        lens,
        result.image().nrows(),
        result.image().ncols(),
        result.camera_extent().width().get::<micron>(),
        result.strategy()
    );
    info!(
        "peak-to-valley depth={:.2} defocus={:.2} astigmatism={:.2} collar={:.2} rad, supercritical fraction {:.4}",
        stats.depth,
        stats.defocus,
        stats.astigmatism,
        stats.collar,
        result.supercritical_fraction()
    );

    write_png(&args.output, result.image())?;
    info!("wrote camera image to {}", args.output.display());

    if let Some(path) = args.pupil_output {
        let (pupil, name) = match args.pupil_phase {
            true => (result.pupil_phase(), "phase"),
            false => (result.pupil_intensity(), "intensity"),
        };
        write_png(&path, pupil)?;
        info!("wrote pupil {name} to {}", path.display());
    }

    Ok(())
}

/// Writes `values` as 8-bit grayscale scaled between their minimum and maximum.
fn write_png(path: &Path, values: &Array2<f64>) -> Result<(), Box<dyn Error>> {
    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min;

    let bytes: Vec<u8> = values
        .iter()
        .map(|&v| match range > 0.0 {
            true => ((v - min) / range * 255.0).round() as u8,
            false => 0,
        })
        .collect();

    image::save_buffer(
        path,
        &bytes,
        values.ncols() as u32,
        values.nrows() as u32,
        image::ExtendedColorType::L8,
    )?;
    Ok(())
}
