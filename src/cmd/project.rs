//! Project initialization command.

use anyhow::Result;

pub fn cmd_init(project_dir: &std::path::Path) -> Result<()> {
    use waypoint::init::init_project;

    let result = init_project(project_dir)?;

    if result.created {
        println!(
            "Initialized waypoint project at {}",
            result.waypoint_dir.display()
        );
        println!();
        println!("Created directory structure:");
        println!("  .waypoint/");
        println!("  ├── workflow.toml   # Phases and agents");
        println!("  ├── runs/           # Run state, reports, consensus records");
        println!("  └── logs/           # waypoint.log");
        println!();
        println!("Next steps:");
        println!("  1. Edit .waypoint/workflow.toml to describe your phases");
        println!("  2. Run `waypoint start` to create a run");
        println!("  3. Run `waypoint advance` to execute the first phase");
    } else if result.wrote_workflow {
        println!(
            "Completed waypoint initialization at {}",
            result.waypoint_dir.display()
        );
    } else {
        println!(
            "Waypoint project already initialized at {}",
            result.waypoint_dir.display()
        );
        println!("Directory structure verified.");
    }

    Ok(())
}
