//! taskboard-server — serves project boards over WebSocket.
//!
//! Every option can also come from a `TASKBOARD_*` environment variable.
//! Log output is controlled by `RUST_LOG`.

use clap::Parser;
use log::info;
use std::path::PathBuf;

use taskboard_collab::{AddColumn, BoardServer, BoardService, NewProject, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "taskboard-server", version, about = "Realtime Kanban board server")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "TASKBOARD_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory; boards are kept in memory when omitted
    #[arg(long, env = "TASKBOARD_STORAGE_PATH", value_name = "PATH")]
    storage_path: Option<PathBuf>,

    /// Outbound frames buffered per connection
    #[arg(long, env = "TASKBOARD_QUEUE_CAPACITY", default_value_t = 256)]
    queue_capacity: usize,

    /// Largest accepted WebSocket frame in bytes
    #[arg(long, env = "TASKBOARD_MAX_FRAME_SIZE", default_value_t = 1 << 20)]
    max_frame_size: usize,

    /// Let concurrent moves in one project interleave (last writer wins)
    #[arg(long, env = "TASKBOARD_OPTIMISTIC_MOVES")]
    optimistic_moves: bool,

    /// Seed a demo project when the store is empty
    #[arg(long, env = "TASKBOARD_DEMO")]
    demo: bool,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind,
            member_queue_capacity: self.queue_capacity,
            serialize_moves: !self.optimistic_moves,
            storage_path: self.storage_path,
            max_frame_size: self.max_frame_size,
        }
    }
}

async fn seed_demo(service: &BoardService) -> Result<(), Box<dyn std::error::Error>> {
    if service.project_exists(1).await? {
        return Ok(());
    }
    let project = service
        .create_project(NewProject::new("Demo board").with_description("Seeded at startup"))
        .await?;
    let mut columns = Vec::new();
    for (order, name) in ["To do", "In progress", "Done"].into_iter().enumerate() {
        let column = service
            .add_column(
                project.id,
                AddColumn {
                    column_name: name.to_string(),
                    order: order as i64 + 1,
                },
            )
            .await?;
        columns.push(column);
    }
    for title in ["Sketch the layout", "Wire up the socket", "Write release notes"] {
        service
            .create_task(project.id, columns[0].id, title, "")
            .await?;
    }
    info!(
        "Seeded demo project {} at /ws/projects/{}/",
        project.name, project.id
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let demo = args.demo;
    let server = BoardServer::new(args.into_config())?;
    info!(
        "Starting taskboard-server on {} ({})",
        server.bind_addr(),
        match &server.config().storage_path {
            Some(path) => format!("storage at {}", path.display()),
            None => "in-memory".to_string(),
        }
    );

    if demo {
        seed_demo(server.service()).await?;
    }

    server.run().await?;
    Ok(())
}
