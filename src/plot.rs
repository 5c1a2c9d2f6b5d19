use std::path::Path;

use once_cell::sync::Lazy;
use plotters::prelude::*;
use plotters::style::{register_font, FontStyle};

use crate::error::{IdcaeError, Result};

const FONT_FAMILY: &str = "sans-serif";

static FONT_REGISTERED: Lazy<bool> = Lazy::new(|| {
    register_font(
        FONT_FAMILY,
        FontStyle::Normal,
        include_bytes!("../assets/DejaVuSans.ttf"),
    )
    .is_ok()
});

/// Make the bundled font available to plotters under `FONT_FAMILY`.
fn ensure_font() -> Result<()> {
    if *FONT_REGISTERED {
        Ok(())
    } else {
        Err(IdcaeError::Plot("bundled font could not be parsed".into()))
    }
}

/// Train vs. validation loss per epoch, written as a PNG.
pub fn loss_plot(train: &[f32], validation: &[f32], path: &Path) -> Result<()> {
    ensure_font()?;
    let epochs = train.len().max(validation.len()).max(2);
    let finite = train.iter().chain(validation).copied().filter(|v| v.is_finite());
    let (lo, hi) = finite.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    let (lo, hi) = if lo.is_finite() && hi > lo {
        (lo, hi)
    } else if lo.is_finite() {
        (lo - 1.0, lo + 1.0)
    } else {
        (0.0, 1.0)
    };
    let pad = (hi - lo) * 0.05;

    let root = BitMapBackend::new(path, (1200, 400)).into_drawing_area();
    root.fill(&WHITE)
        .map_err(|e| IdcaeError::Plot(format!("backend error: {e}")))?;
    {
        let mut chart = ChartBuilder::on(&root)
            .margin(10)
            .caption("Model loss", (FONT_FAMILY, 20))
            .x_label_area_size(30)
            .y_label_area_size(50)
            .build_cartesian_2d(1f32..epochs as f32, (lo - pad)..(hi + pad))
            .map_err(|e| IdcaeError::Plot(format!("chart error: {e}")))?;
        chart
            .configure_mesh()
            .x_desc("Epoch")
            .y_desc("Loss")
            .draw()
            .map_err(|e| IdcaeError::Plot(format!("mesh error: {e}")))?;

        for (series, colour, label) in [(train, BLUE, "Train"), (validation, RED, "Validation")] {
            chart
                .draw_series(LineSeries::new(
                    series
                        .iter()
                        .enumerate()
                        .filter(|(_, v)| v.is_finite())
                        .map(|(i, &v)| ((i + 1) as f32, v)),
                    colour,
                ))
                .map_err(|e| IdcaeError::Plot(format!("draw error: {e}")))?
                .label(label)
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], colour));
        }
        chart
            .configure_series_labels()
            .position(SeriesLabelPosition::UpperRight)
            .background_style(WHITE)
            .border_style(BLACK)
            .draw()
            .map_err(|e| IdcaeError::Plot(format!("legend error: {e}")))?;
    }
    root.present()
        .map_err(|e| IdcaeError::Plot(format!("render error: {e}")))?;
    Ok(())
}
