use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use raw_window_handle::HasRawWindowHandle;
use winit::event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget};
use winit::event::{ElementState, Event, KeyEvent, StartCause, WindowEvent};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowBuilder};

use glutin_winit::DisplayBuilder;
use glutin::config::ConfigTemplateBuilder;
use glutin::context::{Version, ContextApi, ContextAttributesBuilder};
use glutin::context::{NotCurrentGlContext, PossiblyCurrentContext};
use glutin::surface::{GlSurface, Surface, SurfaceAttributesBuilder, WindowSurface};
use glutin::display::{GetGlDisplay, GlDisplay};

use glow::{Context as GlowContext, HasContext};

use picostream::{AcquisitionConfig, DecimationMode, Driver, EdgeFilter, Pipeline, PlotSink,
    SettingsSnapshot, StatusReport, TimeUnit};

const TITLE: &str = "picostream";
const MAX_DECIMATION_RATIO: u32 = 1 << 16;
const THRESHOLD_STEP: i8 = 8;
const SAMPLE_LOG_PATH: &str = "samples.f32";
/// Longest time the event loop sleeps while waiting for the next frame.
const IDLE_WAIT: Duration = Duration::from_millis(5);

#[cfg(feature = "hardware")]
fn device() -> impl Driver + 'static {
    picostream::sys::ps6000a::Ps6000a::new()
}

#[cfg(not(feature = "hardware"))]
fn device() -> impl Driver + 'static {
    use picostream::sys::sim::{Signal, SimDevice};
    SimDevice::new(Signal::Sine { frequency: 50.0, amplitude: 100 })
}

struct PlotRenderer {
    program: <glow::Context as HasContext>::Program,
    vertex_array: <glow::Context as HasContext>::VertexArray,
    point_array: <glow::Context as HasContext>::Buffer,
    points: Vec<[f32; 2]>,
    dirty: bool,
    x_span: f32,
    threshold: Option<f32>,
    status: Option<String>,
}

impl PlotRenderer {
    pub fn new(gl: &glow::Context) -> Self {
        let shaders = [
            (glow::VERTEX_SHADER,   include_str!("plot_vert.glsl")),
            (glow::FRAGMENT_SHADER, include_str!("plot_frag.glsl")),
        ];

        unsafe {
            let program = gl.create_program().expect("failed to create program");
            let mut native_shaders = Vec::new();
            for (kind, source) in shaders {
                let shader = gl.create_shader(kind).expect("failed to create shader");
                gl.shader_source(shader, source);
                gl.compile_shader(shader);
                if !gl.get_shader_compile_status(shader) {
                    panic!("could not compile shader: {}", gl.get_shader_info_log(shader));
                }
                gl.attach_shader(program, shader);
                native_shaders.push(shader);
            }
            gl.link_program(program);
            if !gl.get_program_link_status(program) {
                panic!("{}", gl.get_program_info_log(program));
            }
            for shader in native_shaders {
                gl.detach_shader(program, shader);
                gl.delete_shader(shader);
            }

            let vertex_array = gl.create_vertex_array().expect("failed to create vertex array");
            let point_array = gl.create_buffer().expect("failed to create buffer");
            Self {
                program,
                vertex_array,
                point_array,
                points: Vec::new(),
                dirty: false,
                x_span: 0.0,
                threshold: None,
                status: None,
            }
        }
    }

    /// Fixes the horizontal axis to `time_window`, so a filling ring grows from the left.
    pub fn set_x_span(&mut self, time_window: Duration) {
        self.x_span = time_window.as_secs_f32();
    }

    pub fn set_threshold(&mut self, threshold: Option<i8>) {
        self.threshold = threshold.map(f32::from);
    }

    pub fn take_status(&mut self) -> Option<String> {
        self.status.take()
    }

    pub fn resize(&mut self, gl: &glow::Context, width: u32, height: u32) {
        unsafe {
            gl.viewport(0, 0, width as i32, height as i32);
        }
    }

    fn draw(&self, gl: &glow::Context, points: &[[f32; 2]], color: [f32; 3]) {
        let point_loc = unsafe { gl.get_attrib_location(self.program, "point") }
            .expect("could not retrieve attribute location");
        unsafe {
            gl.uniform_3_f32(gl.get_uniform_location(self.program, "trace_color").as_ref(),
                color[0], color[1], color[2]);
            gl.bind_vertex_array(Some(self.vertex_array));
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(self.point_array));
            gl.buffer_data_u8_slice(glow::ARRAY_BUFFER, bytemuck::cast_slice(points),
                glow::STREAM_DRAW);
            gl.enable_vertex_attrib_array(point_loc);
            gl.vertex_attrib_pointer_f32(point_loc, 2, glow::FLOAT, false, 8, 0);
            gl.draw_arrays(glow::LINE_STRIP, 0, points.len() as i32);
            gl.disable_vertex_attrib_array(point_loc);
            gl.bind_buffer(glow::ARRAY_BUFFER, None);
        }
    }

    pub fn render(&mut self, gl: &glow::Context) {
        unsafe {
            gl.clear_color(0.1, 0.0, 0.1, 1.0);
            gl.clear(glow::COLOR_BUFFER_BIT);

            gl.use_program(Some(self.program));
            gl.uniform_1_f32(gl.get_uniform_location(self.program, "x_span").as_ref(),
                self.x_span);
            gl.uniform_1_f32(gl.get_uniform_location(self.program, "y_full_scale").as_ref(),
                128.0);
        }
        if let Some(level) = self.threshold {
            self.draw(gl, &[[0.0, level], [self.x_span, level]], [0.4, 0.4, 0.8]);
        }
        if self.points.len() >= 2 {
            self.draw(gl, &self.points, [1.0, 1.0, 0.0]);
        }
        self.dirty = false;
    }

    pub fn destroy(&mut self, gl: &glow::Context) {
        unsafe {
            gl.delete_program(self.program);
            gl.delete_vertex_array(self.vertex_array);
            gl.delete_buffer(self.point_array);
        }
    }
}

impl PlotSink for PlotRenderer {
    fn set_data(&mut self, points: &[[f32; 2]]) {
        self.points.clear();
        self.points.extend_from_slice(points);
        self.dirty = true;
    }

    fn set_status(&mut self, report: &StatusReport) {
        self.status = Some(report.to_string());
    }
}

struct Application<D: Driver + 'static> {
    gl_context: PossiblyCurrentContext,
    gl_surface: Surface<WindowSurface>,
    gl_library: GlowContext,
    plot_renderer: PlotRenderer,
    pipeline: Pipeline<D>,
    window: Window,
}

impl<D: Driver + 'static> Application<D> {
    fn sync_plot(&mut self) {
        let settings = self.pipeline.settings().clone();
        self.plot_renderer.set_x_span(settings.time_window);
        let trigger = settings.acquisition.trigger;
        self.plot_renderer.set_threshold(trigger.enabled.then_some(trigger.threshold));
        if trigger.enabled {
            log::info!("trigger on {:?} edges at {:.1} mV", trigger.direction,
                trigger.threshold_millivolts(self.pipeline.channel().range));
        }
        self.window.request_redraw();
    }

    fn apply_settings(&mut self) {
        match self.pipeline.apply_settings() {
            Ok(report) => {
                for warning in &report.warnings {
                    log::warn!("{}", warning);
                }
            }
            Err(error) => log::error!("failed to apply settings: {}", error),
        }
        self.sync_plot();
    }

    fn toggle_streaming(&mut self) {
        let result = if self.pipeline.is_streaming() {
            self.pipeline.stop()
        } else {
            self.pipeline.start().map(|_| ())
        };
        if let Err(error) = result {
            log::error!("{}", error);
            self.window.set_title(&format!("{} | {}", TITLE, error));
        }
        self.sync_plot();
    }

    fn handle_key(&mut self, key: &Key, window_target: &EventLoopWindowTarget<()>) {
        let desired = self.pipeline.desired_mut();
        match key.as_ref() {
            Key::Named(NamedKey::Escape) => return window_target.exit(),
            Key::Named(NamedKey::Space) => return self.toggle_streaming(),
            Key::Named(NamedKey::ArrowUp) => {
                let ratio = &mut desired.acquisition.decimation_ratio;
                *ratio = ratio.saturating_mul(2).min(MAX_DECIMATION_RATIO);
            }
            Key::Named(NamedKey::ArrowDown) => {
                let ratio = &mut desired.acquisition.decimation_ratio;
                *ratio = (*ratio / 2).max(1);
            }
            Key::Named(NamedKey::ArrowRight) =>
                desired.time_window = desired.time_window.saturating_mul(2),
            Key::Named(NamedKey::ArrowLeft) =>
                desired.time_window /= 2,
            Key::Character("t") => {
                let trigger = &mut desired.acquisition.trigger;
                trigger.enabled = !trigger.enabled;
            }
            Key::Character("e") => {
                let trigger = &mut desired.acquisition.trigger;
                trigger.direction = match trigger.direction {
                    EdgeFilter::Rising  => EdgeFilter::Falling,
                    EdgeFilter::Falling => EdgeFilter::Both,
                    EdgeFilter::Both    => EdgeFilter::Rising,
                };
            }
            Key::Character("m") => {
                let mode = &mut desired.acquisition.decimation_mode;
                let index = DecimationMode::ALL.iter().position(|candidate| candidate == mode)
                    .unwrap_or(0);
                *mode = DecimationMode::ALL[(index + 1) % DecimationMode::ALL.len()];
            }
            Key::Character("l") => {
                let sample_log = &mut desired.sample_log;
                sample_log.enabled = !sample_log.enabled;
                sample_log.path.get_or_insert_with(|| SAMPLE_LOG_PATH.into());
            }
            Key::Character("+" | "=") => {
                let threshold = &mut desired.acquisition.trigger.threshold;
                *threshold = threshold.saturating_add(THRESHOLD_STEP);
            }
            Key::Character("-") => {
                let threshold = &mut desired.acquisition.trigger.threshold;
                *threshold = threshold.saturating_sub(THRESHOLD_STEP);
            }
            _ => return,
        }
        self.apply_settings();
    }

    fn process_event(&mut self, event: Event<()>, window_target: &EventLoopWindowTarget<()>) {
        match event {
            Event::NewEvents(StartCause::ResumeTimeReached { .. } | StartCause::Poll) => {
                let now = Instant::now();
                match self.pipeline.tick(now, &mut self.plot_renderer) {
                    Ok(_) => (),
                    Err(error) => {
                        log::error!("{}", error);
                        self.window.set_title(&format!("{} | {}", TITLE, error));
                    }
                }
                if let Some(status) = self.plot_renderer.take_status() {
                    self.window.set_title(&format!("{} | {}", TITLE, status));
                }
                if self.plot_renderer.dirty {
                    self.window.request_redraw();
                }
                let wake_at = self.pipeline.pump().next_due()
                    .map_or(now + IDLE_WAIT, |next_due| next_due.min(now + IDLE_WAIT));
                window_target.set_control_flow(ControlFlow::WaitUntil(wake_at));
            }
            Event::WindowEvent { event: WindowEvent::RedrawRequested, .. } => {
                self.window.pre_present_notify();
                self.plot_renderer.render(&self.gl_library);
                self.gl_surface.swap_buffers(&self.gl_context)
                    .expect("failed to swap buffers");
            }
            Event::WindowEvent { event: WindowEvent::Resized(size), .. } => {
                let (Some(width), Some(height)) =
                    (NonZeroU32::new(size.width), NonZeroU32::new(size.height)) else { return };
                self.plot_renderer.resize(&self.gl_library, size.width, size.height);
                self.gl_surface.resize(&self.gl_context, width, height);
                self.window.request_redraw();
            }
            Event::WindowEvent {
                event: WindowEvent::KeyboardInput {
                    event: KeyEvent { logical_key, state: ElementState::Pressed, .. }, ..
                }, ..
            } => {
                self.handle_key(&logical_key, window_target);
            }
            Event::WindowEvent { event: WindowEvent::CloseRequested, .. } => {
                window_target.exit();
            }
            Event::LoopExiting => {
                if let Err(error) = self.pipeline.shutdown() {
                    log::error!("{}", error);
                }
                self.plot_renderer.destroy(&self.gl_library);
            }
            _ => (),
        }
    }
}

fn main() -> picostream::Result<()> {
    env_logger::Builder::from_default_env()
        .format_timestamp_micros()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
    // create a window
    let event_loop = EventLoop::new().expect("failed to create event loop");
    event_loop.set_control_flow(ControlFlow::wait_duration(Duration::ZERO));
    let window_builder = WindowBuilder::new()
        .with_title(TITLE);
    let config_template_builder = ConfigTemplateBuilder::new()
        .prefer_hardware_accelerated(Some(true));
    let (window, gl_config) = DisplayBuilder::new()
        .with_window_builder(Some(window_builder))
        .build(&event_loop, config_template_builder, |mut configs|
            configs.next().expect("no GL configurations available"))
        .expect("failed to create window");
    let window = window.expect("no window was created");
    let (width, height) = window.inner_size().into();
    // create an OpenGL context
    let context_attributes = ContextAttributesBuilder::new()
        .with_context_api(ContextApi::Gles(Some(Version::new(3, 0))))
        .build(Some(window.raw_window_handle()));
    let gl_context = unsafe {
        gl_config.display().create_context(&gl_config, &context_attributes)
            .expect("failed to create GL context")
    };
    let surface_attributes = SurfaceAttributesBuilder::<WindowSurface>::new()
        .build(window.raw_window_handle(),
            NonZeroU32::new(width).unwrap_or(NonZeroU32::MIN),
            NonZeroU32::new(height).unwrap_or(NonZeroU32::MIN),
        );
    let gl_surface = unsafe {
        gl_config.display().create_window_surface(&gl_config, &surface_attributes)
            .expect("failed to create GL surface")
    };
    let gl_context = gl_context.make_current(&gl_surface)
        .expect("failed to make GL context current");
    let gl_library = unsafe {
        GlowContext::from_loader_function_cstr(|func|
            gl_config.display().get_proc_address(func).cast())
    };
    // set up the acquisition pipeline
    let settings = SettingsSnapshot {
        acquisition: AcquisitionConfig {
            sample_interval: 1,
            time_unit: TimeUnit::Us,
            samples_per_buffer: 10_000,
            decimation_ratio: 100,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut pipeline = Pipeline::new(device(), Default::default(), settings);
    pipeline.start()?;
    // run the application
    let mut application = Application {
        gl_context,
        gl_surface,
        plot_renderer: PlotRenderer::new(&gl_library),
        gl_library,
        pipeline,
        window,
    };
    application.sync_plot();
    event_loop.run(|event, window_target|
        application.process_event(event, window_target))
        .expect("failed to run application");
    Ok(())
}
