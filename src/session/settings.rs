use anyhow::Result;

use crate::{
    engine::{Handle, ObjectType, Param, RenderEngine},
    protocol::{CameraKind, CameraSettings, RenderSettings, WorldSettings},
};

pub fn apply_render_settings(
    engine: &dyn RenderEngine,
    renderer: &Handle,
    renderer_type: &str,
    s: &RenderSettings,
) {
    engine.set_param(renderer, "maxDepth", Param::Int(s.max_depth));
    engine.set_param(renderer, "minContribution", Param::Float(s.min_contribution));
    engine.set_param(renderer, "varianceThreshold", Param::Float(s.variance_threshold));

    if renderer_type == "scivis" {
        engine.set_param(renderer, "aoSamples", Param::Int(s.ao_samples));
        engine.set_param(renderer, "aoRadius", Param::Float(s.ao_radius));
        engine.set_param(renderer, "aoIntensity", Param::Float(s.ao_intensity));
    } else {
        engine.set_param(renderer, "rouletteDepth", Param::Int(s.roulette_depth));
        engine.set_param(renderer, "maxContribution", Param::Float(s.max_contribution));
        engine.set_param(renderer, "geometryLights", Param::Bool(s.geometry_lights));
    }
    engine.commit(renderer);
}

/// Ambient light colour and renderer background. The path tracer takes the
/// background as a 1x1 backplate texture instead of a colour.
pub fn apply_world_settings(
    engine: &dyn RenderEngine,
    renderer: &Handle,
    renderer_type: &str,
    ambient_light: &Handle,
    s: &WorldSettings,
) -> Result<()> {
    engine.set_param(ambient_light, "color", Param::Vec3f(s.ambient_color));
    engine.set_param(ambient_light, "intensity", Param::Float(s.ambient_intensity));
    engine.commit(ambient_light);

    if renderer_type == "scivis" {
        engine.set_param(renderer, "bgColor", Param::Vec4f(s.background_color));
    } else {
        let backplate = engine.create(ObjectType::Texture, "texture2d")?;
        engine.set_param(&backplate, "format", Param::String("rgba32f".to_string()));
        engine.set_param(&backplate, "size", Param::Vec2f([1.0, 1.0]));
        engine.set_param(&backplate, "data", Param::Vec4fArray(vec![s.background_color]));
        engine.commit(&backplate);
        engine.set_param(renderer, "backplate", Param::Object(backplate));
    }
    engine.commit(renderer);
    Ok(())
}

/// Cameras are rebuilt on every update.
pub fn build_camera(engine: &dyn RenderEngine, s: &CameraSettings) -> Result<Handle> {
    let camera = match s.kind {
        CameraKind::Perspective => {
            let camera = engine.create(ObjectType::Camera, "perspective")?;
            engine.set_param(&camera, "fovy", Param::Float(s.fov_y));
            camera
        }
        CameraKind::Orthographic => {
            let camera = engine.create(ObjectType::Camera, "orthographic")?;
            engine.set_param(&camera, "height", Param::Float(s.height));
            camera
        }
        CameraKind::Panoramic => engine.create(ObjectType::Camera, "panoramic")?,
    };

    engine.set_param(&camera, "aspect", Param::Float(s.aspect));
    engine.set_param(&camera, "nearClip", Param::Float(s.clip_start));
    engine.set_param(&camera, "position", Param::Vec3f(s.position));
    engine.set_param(&camera, "direction", Param::Vec3f(s.view_dir));
    engine.set_param(&camera, "up", Param::Vec3f(s.up_dir));

    // A zero focus distance disables depth of field.
    if s.dof_focus_distance > 0.0 {
        engine.set_param(&camera, "focusDistance", Param::Float(s.dof_focus_distance));
        engine.set_param(&camera, "apertureRadius", Param::Float(s.dof_aperture));
    }

    if let Some([x0, y0, x1, y1]) = s.border {
        engine.set_param(&camera, "imageStart", Param::Vec2f([x0, y0]));
        engine.set_param(&camera, "imageEnd", Param::Vec2f([x1, y1]));
    }

    engine.commit(&camera);
    Ok(camera)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::software::SoftwareEngine;

    fn camera_settings() -> CameraSettings {
        CameraSettings {
            object_name: "Camera".to_string(),
            camera_name: "Camera".to_string(),
            kind: CameraKind::Perspective,
            position: [0.0, -5.0, 0.0],
            view_dir: [0.0, 1.0, 0.0],
            up_dir: [0.0, 0.0, 1.0],
            fov_y: 40.0,
            height: 0.0,
            aspect: 1.5,
            clip_start: 0.1,
            dof_focus_distance: 0.0,
            dof_aperture: 0.0,
            border: None,
        }
    }

    #[test]
    fn depth_of_field_only_with_positive_focus_distance() {
        let engine = SoftwareEngine::new();
        let camera = build_camera(&engine, &camera_settings()).unwrap();
        assert!(engine.param(&camera, "focusDistance").is_none());

        let mut s = camera_settings();
        s.dof_focus_distance = 3.0;
        s.dof_aperture = 0.1;
        s.border = Some([0.25, 0.25, 0.75, 0.75]);
        let camera = build_camera(&engine, &s).unwrap();
        assert!(matches!(engine.param(&camera, "focusDistance"), Some(Param::Float(d)) if d == 3.0));
        assert!(matches!(engine.param(&camera, "imageEnd"), Some(Param::Vec2f([0.75, 0.75]))));
    }

    #[test]
    fn path_tracer_background_goes_through_a_backplate() {
        let engine = SoftwareEngine::new();
        let renderer = engine.create(ObjectType::Renderer, "pathtracer").unwrap();
        let ambient = engine.create(ObjectType::Light, "ambient").unwrap();
        let world = WorldSettings {
            background_color: [0.1, 0.2, 0.3, 1.0],
            ..Default::default()
        };
        apply_world_settings(&engine, &renderer, "pathtracer", &ambient, &world).unwrap();
        assert!(engine.param(&renderer, "bgColor").is_none());
        assert!(matches!(engine.param(&renderer, "backplate"), Some(Param::Object(_))));
    }
}
