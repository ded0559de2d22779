use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn login(&self, email: &str, password: &str) -> zbus::Result<String>;
    fn logout(&self) -> zbus::Result<String>;
    fn list_subjects(&self) -> zbus::Result<String>;
    fn select_subject(&self, subject_id: &str) -> zbus::Result<String>;
    fn start_capture(&self) -> zbus::Result<String>;
    fn capture(&self) -> zbus::Result<String>;
    fn cancel_capture(&self) -> zbus::Result<String>;
    fn recognize(&self) -> zbus::Result<String>;
    fn retake(&self) -> zbus::Result<String>;
    fn confirm(&self) -> zbus::Result<String>;
    fn start_over(&self) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
    fn enroll_face(&self, student_id: &str, image_path: &str) -> zbus::Result<String>;
    fn history(&self, subject_id: &str) -> zbus::Result<String>;
    fn record_detail(&self, record_id: &str) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall classroom attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in as a professor or admin
    Login {
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Sign out and abandon the current session
    Logout,
    /// List subjects you can take attendance for
    Subjects,
    /// Start a session for a subject, dated today
    Select { subject_id: String },
    /// Open the camera
    Start,
    /// Take the photo and run recognition on it
    Take,
    /// Close the camera without taking a photo
    Cancel,
    /// Discard the photo (and any result) and reopen the camera
    Retake,
    /// Save the reviewed attendance
    Confirm,
    /// Abandon the session
    StartOver,
    /// Show daemon and session status
    Status,
    /// Store a student's face template from an image file
    Enroll {
        student_id: String,
        image: PathBuf,
    },
    /// Show saved attendance records for a subject
    History { subject_id: String },
    /// Show every student's status on one saved record
    Record { record_id: String },
    /// Grab one frame directly from the camera (bypasses the daemon)
    CameraTest {
        #[arg(long, default_value = "/dev/video0")]
        device: String,
        #[arg(long, default_value_t = 4)]
        warmup: usize,
        /// Save the grayscale frame as PNG
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let system = cli.system;

    let reply = match cli.command {
        Commands::CameraTest {
            device,
            warmup,
            output,
        } => return camera_test(&device, warmup, output.as_deref()),
        Commands::Login { email, password } => {
            connect(system).await?.login(&email, &password).await
        }
        Commands::Logout => connect(system).await?.logout().await,
        Commands::Subjects => connect(system).await?.list_subjects().await,
        Commands::Select { subject_id } => connect(system).await?.select_subject(&subject_id).await,
        Commands::Start => connect(system).await?.start_capture().await,
        Commands::Take => {
            let proxy = connect(system).await?;
            match proxy.capture().await {
                Ok(_) => proxy.recognize().await,
                Err(e) => Err(e),
            }
        }
        Commands::Cancel => connect(system).await?.cancel_capture().await,
        Commands::Retake => connect(system).await?.retake().await,
        Commands::Confirm => connect(system).await?.confirm().await,
        Commands::StartOver => connect(system).await?.start_over().await,
        Commands::Status => connect(system).await?.status().await,
        Commands::Enroll { student_id, image } => {
            // The daemon resolves the path, so it must be absolute.
            let image = std::fs::canonicalize(&image)
                .with_context(|| format!("resolving {}", image.display()))?;
            connect(system)
                .await?
                .enroll_face(&student_id, &image.to_string_lossy())
                .await
        }
        Commands::History { subject_id } => connect(system).await?.history(&subject_id).await,
        Commands::Record { record_id } => {
            connect(system).await?.record_detail(&record_id).await
        }
    };

    match reply {
        Ok(json) => {
            println!("{}", pretty(&json));
            Ok(())
        }
        Err(zbus::Error::MethodError(_, Some(msg), _)) => anyhow::bail!("{msg}"),
        Err(e) => Err(e.into()),
    }
}

async fn connect(system: bool) -> Result<AttendanceProxy<'static>> {
    tracing::debug!(system, "connecting to rollcalld");
    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")
}

fn pretty(json: &str) -> String {
    serde_json::from_str::<serde_json::Value>(json)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| json.to_string())
}

fn camera_test(device: &str, warmup: usize, output: Option<&std::path::Path>) -> Result<()> {
    println!("Opening {device}...");
    let camera = rollcall_hw::Camera::open(device)?;
    println!("  negotiated {}x{}", camera.width, camera.height);

    let frame = camera.grab(warmup)?;
    println!(
        "  frame #{}: average brightness {:.1}",
        frame.sequence,
        frame.avg_brightness()
    );

    if let Some(path) = output {
        let gray = image::GrayImage::from_raw(frame.width, frame.height, frame.data)
            .context("frame buffer does not match its dimensions")?;
        gray.save(path)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("  saved {}", path.display());
    }
    Ok(())
}
