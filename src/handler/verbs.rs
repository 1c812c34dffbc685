//! Built-in client verbs.
//!
//! Each verb parses its arguments first and only then touches the session,
//! so a malformed command leaves no trace. Verbs that only change the view
//! (`rotate`, `pan`, `zoom`, `screen`, and the scale settings for `all`)
//! return no directives; the coalescer sends them at the next flush.

use super::context::{CommandArgs, DEFAULT_MODEL, Step, StructureSource, Translation};
use super::registry::{CommandRegistry, CommandTraits};
use crate::backend::{Directive, RenderRequest};
use crate::error::Result;
use crate::protocol::{ImageFormat, ImageTag, split_words};
use crate::session::ProxySession;

/// Scale applied to client pan deltas.
pub const PAN_SCALE: f32 = 0.05;

/// Label size when `-size` is not given.
pub const DEFAULT_LABEL_SIZE: u32 = 14;

/// Sphere scale and stick radius when no value is given.
pub const DEFAULT_ATOM_SCALE: f32 = 0.25;

/// Register every built-in verb.
pub fn register_defaults(registry: &mut CommandRegistry) {
    use CommandTraits as T;

    registry.register("cartoon", T::VIEW, cartoon);
    registry.register("cartoontrace", T::VIEW, cartoon_trace);
    registry.register("clientinfo", T::IMMEDIATE, client_info);
    registry.register("disable", T::VIEW, |args, _| show_model(args, "disable"));
    registry.register("enable", T::VIEW, |args, _| show_model(args, "enable"));
    registry.register("frame", T::CACHE_TRANSPARENT, frame);
    registry.register("label", T::VIEW, label);
    registry.register("loadpdb", T::CACHE_TRANSPARENT, load_pdb);
    registry.register("orthoscopic", T::VIEW, orthoscopic);
    registry.register("pan", T::VIEW, pan);
    registry.register("bmp", T::IMMEDIATE, |args, _| render_now(args, ImageFormat::Bmp));
    registry.register("png", T::IMMEDIATE, |args, _| render_now(args, ImageFormat::Png));
    registry.register("ppm", T::IMMEDIATE, |args, _| render_now(args, ImageFormat::Ppm));
    registry.register("print", T::IMMEDIATE, print);
    registry.register("raw", T::VIEW, raw);
    registry.register("representation", T::VIEW, representation);
    registry.register("reset", T::VIEW, reset);
    registry.register("rock", T::CACHE_TRANSPARENT, rock);
    registry.register("rotate", T::VIEW, rotate);
    registry.register("screen", T::VIEW, viewport);
    registry.register("viewport", T::VIEW, viewport);
    registry.register("spherescale", T::VIEW, sphere_scale);
    registry.register("stickradius", T::VIEW, stick_radius);
    registry.register("transparency", T::VIEW, transparency);
    registry.register("vmouse", T::VIEW, vmouse);
    registry.register("zoom", T::VIEW, zoom);
}

fn cartoon(args: CommandArgs, _session: &mut ProxySession) -> Result<Translation> {
    args.at_most(1)?;
    let action = if args.boolean(0, true)? { "show" } else { "hide" };
    Ok(Translation::send(format!("{} cartoon,{}", action, args.model)))
}

fn cartoon_trace(args: CommandArgs, _session: &mut ProxySession) -> Result<Translation> {
    args.at_most(1)?;
    let on = args.boolean(0, true)?;
    Ok(Translation::send(format!(
        "set cartoon_trace,{},{}",
        on as u8, args.model
    )))
}

/// `clientinfo {key value ...}`: remember the pairs for the session record.
fn client_info(args: CommandArgs, session: &mut ProxySession) -> Result<Translation> {
    let words = match args.positional.as_slice() {
        [list] => split_words(list)?,
        other => other.to_vec(),
    };
    if words.len() % 2 != 0 {
        return Err(args.error("expected key/value pairs"));
    }
    let pairs = words
        .chunks(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()));
    session.client_info.extend(pairs);
    Ok(Translation::none())
}

fn show_model(args: CommandArgs, action: &str) -> Result<Translation> {
    args.at_most(1)?;
    let model = args.arg(0).unwrap_or(&args.model);
    Ok(Translation::send(format!("{} {}", action, model)))
}

fn frame(args: CommandArgs, session: &mut ProxySession) -> Result<Translation> {
    args.at_most(1)?;
    let frame: i64 = args.number(0, "frame number")?;
    session.frame = frame;
    Ok(Translation::send(format!("frame {}", frame)))
}

fn label(mut args: CommandArgs, _session: &mut ProxySession) -> Result<Translation> {
    let size = match args.take_option("-size")? {
        Some(text) => text
            .parse::<u32>()
            .map_err(|_| args.error(format!("bad label size \"{}\"", text)))?,
        None => DEFAULT_LABEL_SIZE,
    };
    args.at_most(1)?;
    let on = args.boolean(0, true)?;
    let model = &args.model;

    let setup = Directive::compound([
        format!("set label_color,white,{}", model),
        format!("set label_size,{},{}", size, model),
    ]);
    let toggle = if on {
        format!("label {},\"%s%s\" % (ID,name)", model)
    } else {
        format!("label {}", model)
    };
    Ok(Translation::none().then(Step::Send(setup)).then_send(toggle))
}

/// `loadpdb <data>|follows <model> <state> ?<numBytes>?`
fn load_pdb(args: CommandArgs, session: &mut ProxySession) -> Result<Translation> {
    let data = args.require(0, "data")?;
    let model = args.require(1, "model name")?.to_string();
    let state: i64 = args.number(2, "state")?;

    let source = if data == "follows" {
        args.at_most(4)?;
        let n: usize = args.number(3, "byte count")?;
        StructureSource::Follows(n)
    } else {
        args.at_most(3)?;
        StructureSource::Inline(data.to_string())
    };

    session.cache_id = state;
    Ok(Translation::none().then(Step::LoadStructure {
        source,
        model,
        state,
    }))
}

fn orthoscopic(args: CommandArgs, _session: &mut ProxySession) -> Result<Translation> {
    args.at_most(1)?;
    let on = args.boolean(0, true)?;
    Ok(Translation::send(format!("set orthoscopic={}", on as u8)))
}

fn pan(args: CommandArgs, session: &mut ProxySession) -> Result<Translation> {
    args.at_most(2)?;
    let x = args.float(0, "x")?;
    let y = args.float(1, "y")?;
    if x != 0.0 || y != 0.0 {
        session.accumulate_pan(x * PAN_SCALE, -y * PAN_SCALE);
    }
    Ok(Translation::none())
}

fn render_now(args: CommandArgs, format: ImageFormat) -> Result<Translation> {
    args.at_most(0)?;
    Ok(Translation::none().then(Step::Render(RenderRequest::current(format))))
}

/// `print <token> <width> <height> <bgcolor>`: high resolution image
/// tagged with the client's token.
fn print(args: CommandArgs, _session: &mut ProxySession) -> Result<Translation> {
    args.at_most(4)?;
    let token = args.require(0, "token")?.to_string();
    let width: u32 = args.number(1, "width")?;
    let height: u32 = args.number(2, "height")?;
    let background = args.require(3, "background color")?;

    let prepare = if background == "none" {
        Directive::compound(["set ray_opaque_background,off", "refresh"])
    } else {
        Directive::compound([
            "set ray_opaque_background,on".to_string(),
            format!("bg_color {}", background),
            "refresh".to_string(),
        ])
    };
    let tag = ImageTag {
        cache_id: token.clone(),
        frame: 0,
        rock_offset: 0.0,
    };
    let png = Directive::new(format!(
        "png -:{}:0:0,width={},height={},ray=1,dpi=300",
        token, width, height
    ));

    Ok(Translation::none()
        .then(Step::Send(prepare))
        .then(Step::Render(RenderRequest::tagged(ImageFormat::Png, png, tag)))
        .then_send("bg_color black"))
}

/// `raw <text>`: pass backend text through unchanged.
fn raw(args: CommandArgs, _session: &mut ProxySession) -> Result<Translation> {
    if args.positional.is_empty() {
        return Err(args.error("missing directive text"));
    }
    Ok(Translation::send(args.positional.join(" ")))
}

fn representation(args: CommandArgs, _session: &mut ProxySession) -> Result<Translation> {
    args.at_most(1)?;
    let rep = args.require(0, "representation")?;
    let m = &args.model;

    let statements: Vec<String> = match rep {
        "ballnstick" => vec![
            format!("set stick_color,white,{}", m),
            format!("show sticks,{}", m),
            format!("show spheres,{}", m),
            format!("hide lines,{}", m),
            format!("hide cartoon,{}", m),
        ],
        "spheres" => vec![
            format!("hide sticks,{}", m),
            format!("show spheres,{}", m),
            format!("hide lines,{}", m),
            format!("hide cartoon,{}", m),
            format!("set sphere_quality,2,{}", m),
            format!("set ambient,.2,{}", m),
        ],
        "none" => vec![
            format!("hide sticks,{}", m),
            format!("hide spheres,{}", m),
            format!("hide lines,{}", m),
            format!("hide cartoon,{}", m),
        ],
        "sticks" => vec![
            format!("set stick_color,white,{}", m),
            format!("show sticks,{}", m),
            format!("hide spheres,{}", m),
            format!("hide lines,{}", m),
            format!("hide cartoon,{}", m),
        ],
        "lines" => vec![
            format!("hide sticks,{}", m),
            format!("hide spheres,{}", m),
            format!("show lines,{}", m),
            format!("hide cartoon,{}", m),
        ],
        "cartoon" => vec![
            format!("hide sticks,{}", m),
            format!("hide spheres,{}", m),
            format!("hide lines,{}", m),
            format!("show cartoon,{}", m),
        ],
        other => return Err(args.error(format!("unknown representation \"{}\"", other))),
    };
    Ok(Translation::none().then(Step::Send(Directive::compound(statements))))
}

fn reset(args: CommandArgs, _session: &mut ProxySession) -> Result<Translation> {
    args.at_most(0)?;
    Ok(Translation::none().then(Step::Send(Directive::compound(["reset", "zoom complete=1"]))))
}

/// `rock <angle>`: absolute rock angle, sent as the difference from the
/// previous one.
fn rock(args: CommandArgs, session: &mut ProxySession) -> Result<Translation> {
    args.at_most(1)?;
    let y = args.float(0, "angle")?;
    let delta = y - session.rock_offset;
    session.rock_offset = y;
    Ok(Translation::send(format!("turn y,{:.6}", delta)))
}

fn rotate(args: CommandArgs, session: &mut ProxySession) -> Result<Translation> {
    args.at_most(3)?;
    let x = args.float(0, "x angle")?;
    let y = args.float(1, "y angle")?;
    let z = args.float(2, "z angle")?;
    if x != 0.0 || y != 0.0 || z != 0.0 {
        session.accumulate_rotate(x, y, z);
    }
    Ok(Translation::none())
}

/// `screen <w> ?<h>?`: the height defaults to the width.
fn viewport(args: CommandArgs, session: &mut ProxySession) -> Result<Translation> {
    args.at_most(2)?;
    let width: u32 = args.number(0, "width")?;
    let height: u32 = match args.arg(1) {
        Some(_) => args.number(1, "height")?,
        None => width,
    };
    session.set_viewport(width, height);
    Ok(Translation::none())
}

fn atom_setting(
    args: &CommandArgs,
    setting: &str,
) -> Result<(f32, Option<Translation>)> {
    args.at_most(1)?;
    let value = match args.arg(0) {
        Some(_) => args.float(0, "value")?,
        None => DEFAULT_ATOM_SCALE,
    };
    if args.model == DEFAULT_MODEL {
        return Ok((value, None));
    }
    let immediate = Translation::send(format!("set {},{:.6},{}", setting, value, args.model));
    Ok((value, Some(immediate)))
}

/// Sphere scale for `all` is coalesced; for a named model it is sent now.
fn sphere_scale(args: CommandArgs, session: &mut ProxySession) -> Result<Translation> {
    match atom_setting(&args, "sphere_scale")? {
        (_, Some(immediate)) => Ok(immediate),
        (value, None) => {
            session.set_sphere_scale(value);
            Ok(Translation::none())
        }
    }
}

fn stick_radius(args: CommandArgs, session: &mut ProxySession) -> Result<Translation> {
    match atom_setting(&args, "stick_radius")? {
        (_, Some(immediate)) => Ok(immediate),
        (value, None) => {
            session.set_stick_radius(value);
            Ok(Translation::none())
        }
    }
}

fn transparency(args: CommandArgs, _session: &mut ProxySession) -> Result<Translation> {
    args.at_most(1)?;
    let value = match args.arg(0) {
        Some(_) => args.float(0, "transparency")?,
        None => 0.0,
    };
    let m = &args.model;
    Ok(Translation::none().then(Step::Send(Directive::compound([
        format!("set sphere_transparency,{},{}", value, m),
        format!("set stick_transparency,{},{}", value, m),
        format!("set cartoon_transparency,{},{}", value, m),
    ]))))
}

fn vmouse(args: CommandArgs, _session: &mut ProxySession) -> Result<Translation> {
    args.at_most(5)?;
    let mut values = [0i32; 5];
    for (i, value) in values.iter_mut().enumerate() {
        *value = args.number(i, "mouse argument")?;
    }
    let [a, b, c, d, e] = values;
    Ok(Translation::send(format!("vmouse {},{},{},{},{}", a, b, c, d, e)))
}

fn zoom(args: CommandArgs, session: &mut ProxySession) -> Result<Translation> {
    args.at_most(1)?;
    let factor = args.float(0, "zoom factor")?;
    if factor != 0.0 {
        session.set_zoom(factor);
    }
    Ok(Translation::none())
}
